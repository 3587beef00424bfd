//! Typed session frames.
//!
//! Every frame is one line of `|`-delimited text. Setup commands and the two
//! acknowledgement literals keep the shapes existing peers speak; vouchers
//! travel as a bare hex blob.

use crate::error::{Error, Result};
use crate::identity::Address;
use crate::ledger::FileId;
use crate::settlement::Voucher;
use bytes::Bytes;
use std::fmt;

/// Acknowledgement sent after a setup command.
pub const SETUP_ACK: &str = "Message Received";

/// Acknowledgement sent after each accepted voucher.
pub const VOUCHER_ACK: &str = "FileReadSettleSlice Received";

const SEPARATOR: char = '|';

/// Session setup command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// `StoreFile|<fileId>`: the node now holds a file and must start proving it.
    StoreFile {
        /// Stored file.
        file_id: FileId,
    },
    /// `ReadFile|<fileId>|<downloaderAddress>`: open a read session.
    ReadFile {
        /// File to read.
        file_id: FileId,
        /// Downloader paying for the read.
        downloader: Address,
    },
}

impl Command {
    /// Parse a setup command line.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Protocol`] if the line is not a known command.
    pub fn parse(line: &str) -> Result<Self> {
        let fields: Vec<&str> = line.trim_end().split(SEPARATOR).collect();
        match fields.as_slice() {
            ["StoreFile", file_id] if !file_id.is_empty() => Ok(Self::StoreFile {
                file_id: FileId::new(*file_id),
            }),
            ["ReadFile", file_id, downloader] if !file_id.is_empty() => Ok(Self::ReadFile {
                file_id: FileId::new(*file_id),
                downloader: downloader.parse()?,
            }),
            _ => Err(Error::Protocol(format!("unknown command: {line}"))),
        }
    }

    /// File the command refers to.
    #[must_use]
    pub fn file_id(&self) -> &FileId {
        match self {
            Self::StoreFile { file_id } | Self::ReadFile { file_id, .. } => file_id,
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::StoreFile { file_id } => write!(f, "StoreFile{SEPARATOR}{file_id}"),
            Self::ReadFile {
                file_id,
                downloader,
            } => write!(f, "ReadFile{SEPARATOR}{file_id}{SEPARATOR}{downloader}"),
        }
    }
}

/// One frame on the session transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Setup command from the connecting peer.
    Command(Command),
    /// [`SETUP_ACK`].
    SetupAck,
    /// [`VOUCHER_ACK`].
    VoucherAck,
    /// `Block|<slice>|<hex>`: one data block.
    Block {
        /// Slice index of the block.
        slice: u64,
        /// Block contents.
        data: Bytes,
    },
    /// Hex-encoded settlement voucher.
    Voucher(Box<Voucher>),
    /// `Close|<slices>`: all blocks served.
    Close {
        /// Number of blocks served in the session.
        slices: u64,
    },
    /// `Abort|<reason>`: the sender is ending the session.
    Abort(String),
}

impl Frame {
    /// Decode one line.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Protocol`] for unknown or malformed frames and
    /// [`Error::MalformedVoucher`] for a hex blob that is not a voucher.
    pub fn decode(line: &str) -> Result<Self> {
        let line = line.trim_end_matches(['\r', '\n']);
        match line {
            SETUP_ACK => return Ok(Self::SetupAck),
            VOUCHER_ACK => return Ok(Self::VoucherAck),
            _ => {}
        }

        let (tag, rest) = line.split_once(SEPARATOR).unwrap_or((line, ""));
        match tag {
            "StoreFile" | "ReadFile" => Command::parse(line).map(Self::Command),
            "Block" => {
                let (slice, data) = rest
                    .split_once(SEPARATOR)
                    .ok_or_else(|| Error::Protocol("block frame without data".to_string()))?;
                let slice = parse_u64(slice, "block slice")?;
                let data = hex::decode(data)
                    .map_err(|e| Error::Protocol(format!("block {slice} data: {e}")))?;
                Ok(Self::Block {
                    slice,
                    data: Bytes::from(data),
                })
            }
            "Close" => Ok(Self::Close {
                slices: parse_u64(rest, "close slice count")?,
            }),
            "Abort" => Ok(Self::Abort(rest.to_string())),
            _ if !line.is_empty() && line.bytes().all(|b| b.is_ascii_hexdigit()) => {
                Voucher::from_hex(line).map(|v| Self::Voucher(Box::new(v)))
            }
            _ => Err(Error::Protocol(format!("unexpected frame: {}", preview(line)))),
        }
    }

    /// Encode as one line without the terminator.
    ///
    /// # Errors
    ///
    /// Returns an error if a voucher cannot be encoded.
    pub fn encode(&self) -> Result<String> {
        Ok(match self {
            Self::Command(cmd) => cmd.to_string(),
            Self::SetupAck => SETUP_ACK.to_string(),
            Self::VoucherAck => VOUCHER_ACK.to_string(),
            Self::Block { slice, data } => {
                format!("Block{SEPARATOR}{slice}{SEPARATOR}{}", hex::encode(data))
            }
            Self::Voucher(voucher) => voucher.to_hex()?,
            Self::Close { slices } => format!("Close{SEPARATOR}{slices}"),
            Self::Abort(reason) => format!("Abort{SEPARATOR}{}", reason.replace(['\r', '\n'], " ")),
        })
    }

    /// Short name for logs and protocol errors.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Command(_) => "command",
            Self::SetupAck => "setup ack",
            Self::VoucherAck => "voucher ack",
            Self::Block { .. } => "block",
            Self::Voucher(_) => "voucher",
            Self::Close { .. } => "close",
            Self::Abort(_) => "abort",
        }
    }
}

fn parse_u64(text: &str, what: &str) -> Result<u64> {
    text.parse()
        .map_err(|_| Error::Protocol(format!("invalid {what}: {}", preview(text))))
}

fn preview(text: &str) -> String {
    text.chars().take(64).collect()
}
