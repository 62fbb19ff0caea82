//! IMAP mailbox syncer: downloads matching attachments from matching messages
//!
//! The syncer talks to the mailbox through [`MailSession`]. Messages are
//! selected with a UID SEARCH built from [`SearchCriteria`], their MIME
//! structure is walked for `attachment` parts with an accepted extension and
//! each part is fetched, transfer-decoded and handed to the download
//! primitive.

use super::{check_cancelled, SourceStats, SourceSyncer, SyncTarget};
use crate::config::{FilterField, ImapConfig, Source};
use crate::download::sanitize_file_name;
use crate::error::SyncError;
use base64::alphabet;
use base64::engine::general_purpose::{GeneralPurpose, GeneralPurposeConfig};
use base64::engine::DecodePaddingMode;
use base64::Engine;
use std::fmt;
use std::io::{self, Cursor};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const DEFAULT_CONNECT_RETRIES: u32 = 3;
const DEFAULT_RETRY_PAUSE: Duration = Duration::from_secs(1);

/// Base64 as found in the wild: padding optional
const LENIENT_BASE64: GeneralPurpose = GeneralPurpose::new(
    &alphabet::STANDARD,
    GeneralPurposeConfig::new().with_decode_padding_mode(DecodePaddingMode::Indifferent),
);

/// Which messages to look at
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchCriteria {
    pub unseen_only: bool,
    pub header: Option<(FilterField, String)>,
}

impl SearchCriteria {
    pub fn from_config(config: &ImapConfig) -> Self {
        Self {
            unseen_only: !config.process_read_emails,
            header: config
                .filter_field
                .map(|field| (field, config.filter_value.clone())),
        }
    }

    /// Render as an IMAP SEARCH query; deleted messages are always excluded
    pub fn to_imap_query(&self) -> String {
        let mut query = String::from("UNDELETED");

        if self.unseen_only {
            query.push_str(" UNSEEN");
        }

        if let Some((field, value)) = &self.header {
            let key = match field {
                FilterField::To => "TO",
                FilterField::Subject => "SUBJECT",
            };
            query.push_str(&format!(" {} {}", key, quote(value)));
        }

        query
    }
}

fn quote(value: &str) -> String {
    format!("\"{}\"", value.replace('\\', "\\\\").replace('"', "\\\""))
}

/// Content-Transfer-Encoding of a MIME part
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferEncoding {
    /// 7bit, 8bit, binary or no encoding at all
    Identity,
    Base64,
    QuotedPrintable,
    Unknown(String),
}

impl TransferEncoding {
    pub fn parse(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "" | "7bit" | "8bit" | "binary" => TransferEncoding::Identity,
            "base64" => TransferEncoding::Base64,
            "quoted-printable" => TransferEncoding::QuotedPrintable,
            other => TransferEncoding::Unknown(other.to_string()),
        }
    }

    pub fn decode(&self, raw: Vec<u8>) -> io::Result<Vec<u8>> {
        match self {
            TransferEncoding::Identity => Ok(raw),
            TransferEncoding::Base64 => {
                let compact: Vec<u8> = raw
                    .into_iter()
                    .filter(|b| !b.is_ascii_whitespace())
                    .collect();
                LENIENT_BASE64
                    .decode(compact)
                    .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
            }
            TransferEncoding::QuotedPrintable => {
                quoted_printable::decode(raw, quoted_printable::ParseMode::Robust)
                    .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))
            }
            TransferEncoding::Unknown(name) => {
                warn!("Unknown transfer encoding '{}', saving attachment as-is", name);
                Ok(raw)
            }
        }
    }
}

/// Content-Disposition of a MIME part
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Disposition {
    pub kind: String,
    pub filename: Option<String>,
}

/// MIME body structure as reported by the server
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BodyPart {
    Single {
        disposition: Option<Disposition>,
        encoding: TransferEncoding,
        size: u64,
    },
    Multipart {
        parts: Vec<BodyPart>,
    },
}

/// An attachment candidate and where to fetch it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttachmentPart {
    /// IMAP section path, e.g. `[2, 1]` for `BODY[2.1]`
    pub path: Vec<u32>,
    pub filename: String,
    pub encoding: TransferEncoding,
    pub size: u64,
}

impl AttachmentPart {
    pub fn section(&self) -> String {
        section_string(&self.path)
    }
}

fn section_string(path: &[u32]) -> String {
    path.iter()
        .map(u32::to_string)
        .collect::<Vec<_>>()
        .join(".")
}

impl BodyPart {
    /// Every `attachment` part carrying a filename, in part order
    pub fn attachments(&self) -> Vec<AttachmentPart> {
        let mut found = Vec::new();
        self.collect_attachments(Vec::new(), &mut found);
        found
    }

    fn collect_attachments(&self, path: Vec<u32>, found: &mut Vec<AttachmentPart>) {
        match self {
            BodyPart::Single {
                disposition,
                encoding,
                size,
            } => {
                let Some(Disposition {
                    kind,
                    filename: Some(filename),
                }) = disposition
                else {
                    return;
                };
                if !kind.eq_ignore_ascii_case("attachment") {
                    return;
                }

                // A single-part message is addressed as part 1
                let path = if path.is_empty() { vec![1] } else { path };
                found.push(AttachmentPart {
                    path,
                    filename: filename.clone(),
                    encoding: encoding.clone(),
                    size: *size,
                });
            }
            BodyPart::Multipart { parts } => {
                for (index, part) in parts.iter().enumerate() {
                    let mut child = path.clone();
                    child.push(index as u32 + 1);
                    part.collect_attachments(child, found);
                }
            }
        }
    }
}

/// Envelope details and structure of one message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageSummary {
    pub sender: String,
    pub subject: String,
    pub structure: BodyPart,
}

/// Operations on a logged-in session with the mailbox selected
pub trait MailSession: Send {
    /// UIDs of matching messages
    fn search(&mut self, criteria: &SearchCriteria) -> io::Result<Vec<u32>>;

    fn fetch_summary(&mut self, uid: u32) -> io::Result<MessageSummary>;

    /// Raw, still transfer-encoded bytes of one body part
    fn fetch_section(&mut self, uid: u32, path: &[u32]) -> io::Result<Vec<u8>>;

    fn mark_deleted(&mut self, uid: u32) -> io::Result<()>;

    fn expunge(&mut self) -> io::Result<()>;

    fn logout(&mut self) -> io::Result<()>;
}

/// Opens a session and selects the configured mailbox
pub trait ImapConnector: Send + Sync {
    fn connect(&self, config: &ImapConfig) -> io::Result<Box<dyn MailSession>>;
}

/// Syncs attachments from one IMAP mailbox
pub struct ImapSyncer {
    config: ImapConfig,
    connector: Arc<dyn ImapConnector>,
    label: String,
    retries: u32,
    retry_pause: Duration,
}

impl ImapSyncer {
    pub fn new(config: ImapConfig, connector: Arc<dyn ImapConnector>) -> Self {
        let label = Source::Imap(config.clone()).label();
        Self {
            config,
            connector,
            label,
            retries: DEFAULT_CONNECT_RETRIES,
            retry_pause: DEFAULT_RETRY_PAUSE,
        }
    }

    pub fn with_retry_policy(mut self, retries: u32, pause: Duration) -> Self {
        self.retries = retries;
        self.retry_pause = pause;
        self
    }

    fn connect(&self, cancel: &CancellationToken) -> Result<Box<dyn MailSession>, SyncError> {
        let mut attempt = 0;

        loop {
            match self.connector.connect(&self.config) {
                Ok(session) => return Ok(session),
                Err(e) if attempt < self.retries => {
                    attempt += 1;
                    warn!(
                        "Connecting to {} failed ({}), retry {}/{}",
                        self.label, e, attempt, self.retries
                    );
                    check_cancelled(cancel)?;
                    std::thread::sleep(self.retry_pause);
                }
                Err(e) => {
                    return Err(SyncError::Connect {
                        endpoint: self.label.clone(),
                        reason: e.to_string(),
                    })
                }
            }
        }
    }

    fn sync_mailbox(
        &self,
        session: &mut dyn MailSession,
        cancel: &CancellationToken,
        target: &SyncTarget,
    ) -> Result<SourceStats, SyncError> {
        let list_error = |path: String, e: io::Error| SyncError::List {
            endpoint: self.label.clone(),
            path,
            reason: e.to_string(),
        };

        let criteria = SearchCriteria::from_config(&self.config);
        debug!("Searching {} with {}", self.label, criteria.to_imap_query());
        let uids = session
            .search(&criteria)
            .map_err(|e| list_error(self.config.mailbox.clone(), e))?;
        info!("{}: {} matching messages", self.label, uids.len());

        let mut stats = SourceStats::default();

        for uid in uids {
            check_cancelled(cancel)?;

            let summary = session
                .fetch_summary(uid)
                .map_err(|e| list_error(format!("{}/{}", self.config.mailbox, uid), e))?;

            let attachments: Vec<AttachmentPart> = summary
                .structure
                .attachments()
                .into_iter()
                .filter(|a| target.extensions.matches(&a.filename))
                .collect();

            if attachments.is_empty() {
                debug!("Message {} has no matching attachments", uid);
                continue;
            }

            let mut stored = 0;
            for attachment in &attachments {
                check_cancelled(cancel)?;

                let dest_name = sanitize_file_name(&attachment.filename);
                let outcome = target.writer.download(
                    &target.folder,
                    &dest_name,
                    target.overwrite,
                    attachment.size,
                    || {
                        let raw = session.fetch_section(uid, &attachment.path)?;
                        Ok(Cursor::new(attachment.encoding.decode(raw)?))
                    },
                )?;

                info!(
                    "Attachment {} from {} (subject: {}) -> {}",
                    attachment.filename,
                    summary.sender,
                    summary.subject,
                    outcome.path().display()
                );
                stats.record(&outcome);
                if outcome.is_stored() {
                    stored += 1;
                }
            }

            if !self.config.remove_emails_after_download {
                continue;
            }

            if stored == 0 {
                info!("[dry-run] Would delete message {} from {}", uid, self.label);
                continue;
            }

            let delete_error = |e: io::Error| SyncError::Delete {
                endpoint: self.label.clone(),
                item: format!("message {}", uid),
                reason: e.to_string(),
            };
            session.mark_deleted(uid).map_err(delete_error)?;
            session.expunge().map_err(delete_error)?;
            info!("Deleted message {} from {}", uid, self.label);
            stats.deleted += 1;
        }

        Ok(stats)
    }
}

impl SourceSyncer for ImapSyncer {
    fn label(&self) -> String {
        self.label.clone()
    }

    fn run(
        &mut self,
        cancel: &CancellationToken,
        target: &SyncTarget,
    ) -> Result<SourceStats, SyncError> {
        let mut session = self.connect(cancel)?;
        info!("Connected to {}", self.label);

        let result = self.sync_mailbox(session.as_mut(), cancel, target);

        if let Err(e) = session.logout() {
            warn!("Failed to log out from {}: {}", self.label, e);
        }

        result
    }
}

/// IMAP over TLS using the `imap` crate
#[derive(Debug, Default, Clone, Copy)]
pub struct TlsImapConnector;

type TlsSession = imap::Session<native_tls::TlsStream<std::net::TcpStream>>;

struct TlsMailSession {
    session: TlsSession,
}

fn to_io<E: fmt::Display>(e: E) -> io::Error {
    io::Error::new(io::ErrorKind::Other, e.to_string())
}

impl ImapConnector for TlsImapConnector {
    fn connect(&self, config: &ImapConfig) -> io::Result<Box<dyn MailSession>> {
        let tls = native_tls::TlsConnector::builder().build().map_err(to_io)?;
        let client =
            imap::connect((config.host.as_str(), config.port()), &config.host, &tls).map_err(to_io)?;

        let mut session = client
            .login(&config.username, config.password.expose())
            .map_err(|(e, _)| to_io(e))?;
        session.select(&config.mailbox).map_err(to_io)?;

        Ok(Box::new(TlsMailSession { session }))
    }
}

fn lossy(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).into_owned()
}

fn body_param(params: &imap_proto::BodyParams<'_>, key: &str) -> Option<String> {
    params
        .as_ref()?
        .iter()
        .find(|(name, _)| name.eq_ignore_ascii_case(key))
        .map(|(_, value)| value.to_string())
}

fn convert_structure(structure: &imap_proto::BodyStructure<'_>) -> BodyPart {
    use imap_proto::{BodyStructure, ContentEncoding};

    match structure {
        BodyStructure::Basic { common, other, .. }
        | BodyStructure::Text { common, other, .. }
        | BodyStructure::Message { common, other, .. } => BodyPart::Single {
            disposition: common.disposition.as_ref().map(|d| Disposition {
                kind: d.ty.to_string(),
                filename: body_param(&d.params, "filename"),
            }),
            encoding: match &other.transfer_encoding {
                ContentEncoding::SevenBit | ContentEncoding::EightBit | ContentEncoding::Binary => {
                    TransferEncoding::Identity
                }
                ContentEncoding::Base64 => TransferEncoding::Base64,
                ContentEncoding::QuotedPrintable => TransferEncoding::QuotedPrintable,
                ContentEncoding::Other(name) => TransferEncoding::parse(name),
            },
            size: u64::from(other.octets),
        },
        BodyStructure::Multipart { bodies, .. } => BodyPart::Multipart {
            parts: bodies.iter().map(convert_structure).collect(),
        },
    }
}

fn envelope_sender(envelope: &imap_proto::Envelope<'_>) -> String {
    let Some(address) = envelope.from.as_ref().and_then(|list| list.first()) else {
        return String::from("unknown sender");
    };

    let mailbox = address.mailbox.as_ref().map(|m| lossy(m)).unwrap_or_default();
    let host = address.host.as_ref().map(|h| lossy(h)).unwrap_or_default();
    if host.is_empty() {
        mailbox
    } else {
        format!("{}@{}", mailbox, host)
    }
}

impl MailSession for TlsMailSession {
    fn search(&mut self, criteria: &SearchCriteria) -> io::Result<Vec<u32>> {
        let mut uids: Vec<u32> = self
            .session
            .uid_search(criteria.to_imap_query())
            .map_err(to_io)?
            .into_iter()
            .collect();
        uids.sort_unstable();
        Ok(uids)
    }

    fn fetch_summary(&mut self, uid: u32) -> io::Result<MessageSummary> {
        let fetches = self
            .session
            .uid_fetch(uid.to_string(), "(UID ENVELOPE BODYSTRUCTURE)")
            .map_err(to_io)?;
        let fetch = fetches
            .iter()
            .next()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, format!("message {} vanished", uid)))?;

        let structure = fetch.bodystructure().ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidData, "server sent no BODYSTRUCTURE")
        })?;

        let (sender, subject) = match fetch.envelope() {
            Some(envelope) => (
                envelope_sender(envelope),
                envelope.subject.as_ref().map(|s| lossy(s)).unwrap_or_default(),
            ),
            None => (String::from("unknown sender"), String::new()),
        };

        Ok(MessageSummary {
            sender,
            subject,
            structure: convert_structure(structure),
        })
    }

    fn fetch_section(&mut self, uid: u32, path: &[u32]) -> io::Result<Vec<u8>> {
        let query = format!("BODY.PEEK[{}]", section_string(path));
        let fetches = self
            .session
            .uid_fetch(uid.to_string(), query)
            .map_err(to_io)?;
        let section = imap_proto::SectionPath::Part(path.to_vec(), None);

        fetches
            .iter()
            .find_map(|fetch| fetch.section(&section))
            .map(<[u8]>::to_vec)
            .ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    format!("no data for part {} of message {}", section_string(path), uid),
                )
            })
    }

    fn mark_deleted(&mut self, uid: u32) -> io::Result<()> {
        self.session
            .uid_store(uid.to_string(), "+FLAGS (\\Deleted)")
            .map(|_| ())
            .map_err(to_io)
    }

    fn expunge(&mut self) -> io::Result<()> {
        self.session.expunge().map(|_| ()).map_err(to_io)
    }

    fn logout(&mut self) -> io::Result<()> {
        self.session.logout().map_err(to_io)
    }
}
