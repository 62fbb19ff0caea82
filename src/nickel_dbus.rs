//! NickelDbus on the system bus and the Nickel hardware status pipe

use crate::error::RescanError;
use crate::rescan::{
    HardwareStatusChannel, RescanKind, RescanService, NICKEL_DBUS_INTERFACE, NICKEL_DBUS_PATH,
};
use async_trait::async_trait;
use futures::StreamExt;
use std::io;
use std::path::PathBuf;
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, OnceCell};
use tracing::debug;
use zbus::{Connection, MatchRule, MessageStream};

pub const HARDWARE_STATUS_PIPE: &str = "/tmp/nickel-hardware-status";

const INTROSPECTABLE_INTERFACE: &str = "org.freedesktop.DBus.Introspectable";
const SIGNAL_BUFFER: usize = 16;

/// NickelDbus reached over the system bus
///
/// The bus connection is opened on first use.
#[derive(Default)]
pub struct NickelDbus {
    connection: OnceCell<Connection>,
}

impl NickelDbus {
    pub fn new() -> Self {
        Self::default()
    }

    async fn connection(&self) -> zbus::Result<&Connection> {
        self.connection.get_or_try_init(Connection::system).await
    }

    async fn call(&self, interface: &str, method: &str) -> zbus::Result<()> {
        let connection = self.connection().await?;
        connection
            .call_method(
                Some(NICKEL_DBUS_INTERFACE),
                NICKEL_DBUS_PATH,
                Some(interface),
                method,
                &(),
            )
            .await?;
        Ok(())
    }

    fn signal_rule() -> zbus::Result<MatchRule<'static>> {
        Ok(MatchRule::builder()
            .msg_type(zbus::message::Type::Signal)
            .interface(NICKEL_DBUS_INTERFACE)?
            .path(NICKEL_DBUS_PATH)?
            .build())
    }
}

#[async_trait]
impl RescanService for NickelDbus {
    async fn is_available(&self) -> bool {
        match self.call(INTROSPECTABLE_INTERFACE, "Introspect").await {
            Ok(()) => true,
            Err(e) => {
                debug!("NickelDbus not available: {}", e);
                false
            }
        }
    }

    async fn subscribe(&self) -> Result<mpsc::Receiver<String>, RescanError> {
        let unavailable = |e: zbus::Error| RescanError::Unavailable(e.to_string());

        let connection = self.connection().await.map_err(unavailable)?;
        let rule = Self::signal_rule().map_err(unavailable)?;
        let mut stream = MessageStream::for_match_rule(rule, connection, Some(SIGNAL_BUFFER))
            .await
            .map_err(unavailable)?;

        let (tx, rx) = mpsc::channel(SIGNAL_BUFFER);
        tokio::spawn(async move {
            loop {
                let message = tokio::select! {
                    _ = tx.closed() => break,
                    message = stream.next() => message,
                };

                let Some(Ok(message)) = message else { break };
                let name = {
                    let header = message.header();
                    match (header.interface(), header.member()) {
                        (Some(interface), Some(member)) => format!("{}.{}", interface, member),
                        _ => continue,
                    }
                };

                if tx.send(name).await.is_err() {
                    break;
                }
            }
        });

        Ok(rx)
    }

    async fn request_rescan(&self, kind: RescanKind) -> Result<(), RescanError> {
        self.call(NICKEL_DBUS_INTERFACE, kind.method())
            .await
            .map_err(|e| RescanError::Request(e.to_string()))
    }
}

/// Nickel's hardware status named pipe
#[derive(Debug, Clone)]
pub struct NickelHardwareStatus {
    path: PathBuf,
}

impl NickelHardwareStatus {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl Default for NickelHardwareStatus {
    fn default() -> Self {
        Self::new(HARDWARE_STATUS_PIPE)
    }
}

#[async_trait]
impl HardwareStatusChannel for NickelHardwareStatus {
    async fn write(&self, event: &str) -> io::Result<()> {
        // Read-write open never blocks on a FIFO without a reader
        let mut pipe = tokio::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open(&self.path)
            .await?;
        pipe.write_all(event.as_bytes()).await?;
        pipe.flush().await
    }
}
