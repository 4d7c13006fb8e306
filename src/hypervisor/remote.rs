//! libvirt remote protocol client over the local management socket.
//!
//! ## Architecture
//!
//! ```text
//! RemoteHypervisor::connect(socket, uri)
//!     └─► UnixStream (1 s dial timeout)
//!             └─► CONNECT_OPEN(uri)
//!                     ├─► call(proc, args) → reply payload | remote_error
//!                     └─► close()          → CONNECT_CLOSE
//! ```
//!
//! Calls are strictly sequential: one request in flight, replies matched by
//! serial. Packets that are not the reply we wait for are logged and skipped.

use std::path::Path;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;
use tracing::{debug, info, warn};

use crate::error::{AppvmError, Result};
use crate::hypervisor::xdr::{self, DecodeError, XdrReader, XdrWriter};
use crate::hypervisor::{DomainHandle, Hypervisor, MemoryInfo};
use crate::vm::DomainDescriptor;
use crate::vm::descriptor::to_domain_xml;

pub const DIAL_TIMEOUT: Duration = Duration::from_secs(1);

// remote_protocol.x procedure numbers.
pub const PROC_CONNECT_OPEN: i32 = 1;
pub const PROC_CONNECT_CLOSE: i32 = 2;
pub const PROC_DOMAIN_CREATE_XML: i32 = 10;
pub const PROC_DOMAIN_GET_INFO: i32 = 16;
pub const PROC_DOMAIN_LOOKUP_BY_NAME: i32 = 23;
pub const PROC_DOMAIN_SET_MEMORY: i32 = 31;
pub const PROC_DOMAIN_SHUTDOWN: i32 = 33;
pub const PROC_CONNECT_LIST_ALL_DOMAINS: i32 = 273;

const LIST_DOMAINS_ACTIVE: u32 = 1;
const DOMAIN_START_VALIDATE: u32 = 16;

/// Error code used for transport failures that never reached libvirt.
pub const SESSION_ERROR: i32 = -1;

pub struct RemoteHypervisor {
    stream: UnixStream,
    serial: u32,
}

impl RemoteHypervisor {
    /// Dial the management socket and open a connection to `uri`.
    pub async fn connect(socket: &Path, uri: &str) -> Result<Self> {
        let stream = match tokio::time::timeout(DIAL_TIMEOUT, UnixStream::connect(socket)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => return Err(session_error("dial", e)),
            Err(_) => {
                return Err(AppvmError::Hypervisor {
                    operation: "dial",
                    code: SESSION_ERROR,
                    message: format!("timed out after {DIAL_TIMEOUT:?} on {}", socket.display()),
                });
            }
        };

        let mut hv = Self::from_stream(stream);
        hv.open(uri).await?;
        info!(socket = %socket.display(), %uri, "hypervisor session open");
        Ok(hv)
    }

    /// Wrap an already-connected stream without sending `CONNECT_OPEN`.
    pub fn from_stream(stream: UnixStream) -> Self {
        Self { stream, serial: 0 }
    }

    pub async fn open(&mut self, uri: &str) -> Result<()> {
        let mut args = XdrWriter::new();
        args.put_opt_string(Some(uri)).put_u32(0);
        self.call("connect", PROC_CONNECT_OPEN, args).await?;
        Ok(())
    }

    pub async fn close(mut self) -> Result<()> {
        self.call("disconnect", PROC_CONNECT_CLOSE, XdrWriter::new())
            .await?;
        debug!("hypervisor session closed");
        Ok(())
    }

    async fn call(&mut self, operation: &'static str, procedure: i32, args: XdrWriter) -> Result<Bytes> {
        self.serial = self.serial.wrapping_add(1);
        let serial = self.serial;
        let packet = xdr::encode_call(procedure, serial, &args.into_bytes());

        self.stream
            .write_all(&packet)
            .await
            .map_err(|e| session_error(operation, e))?;

        loop {
            let (header, mut body) = self.read_packet(operation).await?;
            if header.kind != xdr::TYPE_REPLY || header.serial != serial || header.procedure != procedure {
                debug!(
                    procedure = header.procedure,
                    serial = header.serial,
                    kind = header.kind,
                    "skipping unrelated packet"
                );
                continue;
            }

            return match header.status {
                xdr::STATUS_OK => Ok(body.into_remaining()),
                xdr::STATUS_ERROR => {
                    let err = xdr::decode_error(&mut body).map_err(|e| protocol_error(operation, e))?;
                    Err(AppvmError::Hypervisor {
                        operation,
                        code: err.code,
                        message: err.message.unwrap_or_else(|| "unknown libvirt error".into()),
                    })
                }
                other => Err(protocol_error(
                    operation,
                    DecodeError(format!("unexpected reply status {other}")),
                )),
            };
        }
    }

    async fn read_packet(&mut self, operation: &'static str) -> Result<(xdr::Header, XdrReader)> {
        let len = self
            .stream
            .read_u32()
            .await
            .map_err(|e| session_error(operation, e))? as usize;

        if !(xdr::PACKET_HEADER_LEN..=xdr::MAX_PACKET_LEN).contains(&len) {
            return Err(protocol_error(
                operation,
                DecodeError(format!("bad packet length {len}")),
            ));
        }

        let mut buf = BytesMut::zeroed(len - 4);
        self.stream
            .read_exact(&mut buf)
            .await
            .map_err(|e| session_error(operation, e))?;

        let mut reader = XdrReader::new(buf.freeze());
        let header = xdr::decode_header(&mut reader).map_err(|e| protocol_error(operation, e))?;
        if header.program != xdr::REMOTE_PROGRAM {
            warn!(program = header.program, "packet for unknown program");
        }
        Ok((header, reader))
    }
}

impl Hypervisor for RemoteHypervisor {
    async fn list_domains(&mut self) -> Result<Vec<DomainHandle>> {
        let mut args = XdrWriter::new();
        args.put_i32(1).put_u32(LIST_DOMAINS_ACTIVE);
        let reply = self
            .call("list domains", PROC_CONNECT_LIST_ALL_DOMAINS, args)
            .await?;
        XdrReader::new(reply)
            .get_domains()
            .map_err(|e| protocol_error("list domains", e))
    }

    async fn lookup(&mut self, name: &str) -> Result<Option<DomainHandle>> {
        let mut args = XdrWriter::new();
        args.put_string(name);
        match self.call("lookup", PROC_DOMAIN_LOOKUP_BY_NAME, args).await {
            Ok(reply) => XdrReader::new(reply)
                .get_domain()
                .map(Some)
                .map_err(|e| protocol_error("lookup", e)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn create(&mut self, descriptor: &DomainDescriptor) -> Result<DomainHandle> {
        let mut args = XdrWriter::new();
        args.put_string(&to_domain_xml(descriptor))
            .put_u32(DOMAIN_START_VALIDATE);
        let reply = self.call("create", PROC_DOMAIN_CREATE_XML, args).await?;
        XdrReader::new(reply)
            .get_domain()
            .map_err(|e| protocol_error("create", e))
    }

    async fn shutdown(&mut self, domain: &DomainHandle) -> Result<()> {
        let mut args = XdrWriter::new();
        args.put_domain(domain);
        self.call("shutdown", PROC_DOMAIN_SHUTDOWN, args).await?;
        Ok(())
    }

    async fn memory_info(&mut self, domain: &DomainHandle) -> Result<MemoryInfo> {
        let mut args = XdrWriter::new();
        args.put_domain(domain);
        let reply = self.call("get info", PROC_DOMAIN_GET_INFO, args).await?;
        decode_info(reply).map_err(|e| protocol_error("get info", e))
    }

    async fn set_memory(&mut self, domain: &DomainHandle, bytes: u64) -> Result<()> {
        let mut args = XdrWriter::new();
        args.put_domain(domain).put_u64(bytes / 1024);
        self.call("set memory", PROC_DOMAIN_SET_MEMORY, args).await?;
        Ok(())
    }
}

/// `remote_domain_get_info_ret`; char and short are widened to 4 bytes on the wire.
fn decode_info(reply: Bytes) -> Result<MemoryInfo, DecodeError> {
    let mut r = XdrReader::new(reply);
    let state = r.get_u32()? as u8;
    let max_kib = r.get_u64()?;
    let current_kib = r.get_u64()?;
    let vcpus = r.get_u32()? as u16;
    let cpu_time_ns = r.get_u64()?;
    Ok(MemoryInfo {
        state,
        max_bytes: max_kib.saturating_mul(1024),
        current_bytes: current_kib.saturating_mul(1024),
        vcpus,
        cpu_time_ns,
    })
}

fn session_error(operation: &'static str, e: std::io::Error) -> AppvmError {
    AppvmError::Hypervisor {
        operation,
        code: SESSION_ERROR,
        message: e.to_string(),
    }
}

fn protocol_error(operation: &'static str, e: DecodeError) -> AppvmError {
    AppvmError::Hypervisor {
        operation,
        code: SESSION_ERROR,
        message: e.to_string(),
    }
}
