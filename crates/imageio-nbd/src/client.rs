use std::collections::HashMap;
use std::io::ErrorKind;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpStream, UnixStream};
use tokio::sync::Mutex;

use crate::error::{NbdError, Result};
use crate::extents::Extent;
use crate::proto::*;

/// Blanket marker for anything we can negotiate an NBD handshake over.
pub trait Stream: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> Stream for T {}

/// A single NBD connection: handshake state plus a serialized request/response channel.
///
/// The transmission phase of NBD is full-duplex in principle, but this client keeps things
/// simple and holds the whole connection behind a mutex; callers wanting concurrency open
/// multiple connections (see [`crate::pool::NbdPool`]).
pub struct NbdClient {
    stream: Mutex<Box<dyn Stream>>,
    export_size: u64,
    transmission_flags: u16,
    meta_context_ids: HashMap<String, u32>,
    next_cookie: std::sync::atomic::AtomicU64,
}

/// Meta-contexts to request during the handshake. `base:allocation` is always requested;
/// callers opt into the qemu-specific ones when the backend's ticket needs them.
#[derive(Debug, Clone, Default)]
pub struct MetaContextRequest {
    pub allocation_depth: bool,
    pub dirty_bitmap: Option<String>,
}

impl NbdClient {
    pub async fn connect_tcp(addr: &str, export: &str, meta: MetaContextRequest) -> Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true).ok();
        Self::handshake(Box::new(stream), export, meta).await
    }

    pub async fn connect_unix(path: &std::path::Path, export: &str, meta: MetaContextRequest) -> Result<Self> {
        let stream = UnixStream::connect(path).await?;
        Self::handshake(Box::new(stream), export, meta).await
    }

    async fn handshake(mut stream: Box<dyn Stream>, export: &str, meta: MetaContextRequest) -> Result<Self> {
        let mut preamble = [0u8; 8 + 8 + 2];
        stream.read_exact(&mut preamble).await?;
        if u64::from_be_bytes(preamble[0..8].try_into().expect("8 bytes")) != NBDMAGIC
            || u64::from_be_bytes(preamble[8..16].try_into().expect("8 bytes")) != IHAVEOPT
        {
            return Err(NbdError::UnsupportedHandshake);
        }
        let handshake_flags = u16::from_be_bytes(preamble[16..18].try_into().expect("2 bytes"));
        if handshake_flags & NBD_FLAG_FIXED_NEWSTYLE == 0 {
            return Err(NbdError::UnsupportedHandshake);
        }

        let mut client_flags = NBD_FLAG_C_FIXED_NEWSTYLE;
        if handshake_flags & NBD_FLAG_NO_ZEROES != 0 {
            client_flags |= NBD_FLAG_C_NO_ZEROES;
        }
        stream.write_all(&client_flags.to_be_bytes()).await?;

        send_option(&mut stream, NBD_OPT_STRUCTURED_REPLY, &[]).await?;
        match read_option_reply(&mut stream, NBD_OPT_STRUCTURED_REPLY).await? {
            (NBD_REP_ACK, _) => {}
            (code, _) => return Err(NbdError::OptionRejected { opt: NBD_OPT_STRUCTURED_REPLY, code }),
        }

        let mut meta_context_ids = HashMap::new();
        let mut wanted = vec![META_CONTEXT_BASE_ALLOCATION.to_owned()];
        if meta.allocation_depth {
            wanted.push(META_CONTEXT_ALLOCATION_DEPTH.to_owned());
        }
        if let Some(bitmap) = &meta.dirty_bitmap {
            wanted.push(format!("{DIRTY_BITMAP_PREFIX}{bitmap}"));
        }
        negotiate_meta_contexts(&mut stream, export, &wanted, &mut meta_context_ids).await?;

        let mut data = Vec::with_capacity(4 + export.len() + 2 + 2);
        data.extend_from_slice(&(export.len() as u32).to_be_bytes());
        data.extend_from_slice(export.as_bytes());
        data.extend_from_slice(&1u16.to_be_bytes()); // one info request
        data.extend_from_slice(&NBD_INFO_EXPORT.to_be_bytes());
        send_option(&mut stream, NBD_OPT_GO, &data).await?;

        let mut export_size = None;
        let mut transmission_flags = 0u16;
        loop {
            let (reply_type, payload) = read_option_reply(&mut stream, NBD_OPT_GO).await?;
            match reply_type {
                NBD_REP_INFO if payload.len() >= 2 && u16::from_be_bytes([payload[0], payload[1]]) == NBD_INFO_EXPORT => {
                    if payload.len() < 12 {
                        return Err(NbdError::Protocol("short NBD_INFO_EXPORT payload"));
                    }
                    export_size = Some(u64::from_be_bytes(payload[2..10].try_into().expect("8 bytes")));
                    transmission_flags = u16::from_be_bytes(payload[10..12].try_into().expect("2 bytes"));
                }
                NBD_REP_INFO => continue,
                NBD_REP_ACK => break,
                code if code == NBD_REP_ERR_UNSUP || code & NBD_REP_FLAG_ERROR != 0 => {
                    return Err(NbdError::NoSuchExport { export: export.to_owned() });
                }
                code => return Err(NbdError::OptionRejected { opt: NBD_OPT_GO, code }),
            }
        }

        let export_size = export_size.ok_or(NbdError::Protocol("server never sent NBD_INFO_EXPORT"))?;

        Ok(Self {
            stream: Mutex::new(stream),
            export_size,
            transmission_flags,
            meta_context_ids,
            next_cookie: std::sync::atomic::AtomicU64::new(1),
        })
    }

    pub fn export_size(&self) -> u64 {
        self.export_size
    }

    pub fn supports_flush(&self) -> bool {
        self.transmission_flags & NBD_FLAG_SEND_FLUSH != 0
    }

    pub fn supports_write_zeroes(&self) -> bool {
        self.transmission_flags & NBD_FLAG_SEND_WRITE_ZEROES != 0
    }

    pub fn supports_trim(&self) -> bool {
        self.transmission_flags & NBD_FLAG_SEND_TRIM != 0
    }

    pub fn supports_block_status(&self) -> bool {
        self.transmission_flags & NBD_FLAG_SEND_BLOCK_STATUS != 0 && !self.meta_context_ids.is_empty()
    }

    pub fn read_only(&self) -> bool {
        self.transmission_flags & NBD_FLAG_READ_ONLY != 0
    }

    fn cookie(&self) -> u64 {
        self.next_cookie.fetch_add(1, std::sync::atomic::Ordering::Relaxed)
    }

    fn check_range(&self, offset: u64, length: u64) -> Result<()> {
        if offset.checked_add(length).map(|end| end > self.export_size).unwrap_or(true) {
            return Err(NbdError::OutOfRange { size: self.export_size });
        }
        Ok(())
    }

    pub async fn read(&self, offset: u64, length: u32, dst: &mut [u8]) -> Result<()> {
        self.check_range(offset, length as u64)?;
        assert_eq!(dst.len(), length as usize, "caller must size dst to length");
        let cookie = self.cookie();
        let mut stream = self.stream.lock().await;
        send_request(&mut *stream, NBD_CMD_READ, 0, cookie, offset, length, None).await?;
        read_structured_data_reply(&mut *stream, offset, dst).await
    }

    pub async fn write(&self, offset: u64, data: &[u8], fua: bool) -> Result<()> {
        self.check_range(offset, data.len() as u64)?;
        let flags = if fua { NBD_CMD_FLAG_FUA } else { 0 };
        let cookie = self.cookie();
        let mut stream = self.stream.lock().await;
        send_request(&mut *stream, NBD_CMD_WRITE, flags, cookie, offset, data.len() as u32, Some(data)).await?;
        read_simple_ack(&mut *stream).await
    }

    pub async fn write_zeroes(&self, offset: u64, length: u64, fua: bool, punch_hole: bool) -> Result<()> {
        self.check_range(offset, length)?;
        let mut flags = if fua { NBD_CMD_FLAG_FUA } else { 0 };
        if !punch_hole {
            flags |= NBD_CMD_FLAG_NO_HOLE;
        }
        let cookie = self.cookie();
        let mut stream = self.stream.lock().await;
        send_request(&mut *stream, NBD_CMD_WRITE_ZEROES, flags, cookie, offset, length.try_into().unwrap_or(u32::MAX), None).await?;
        read_simple_ack(&mut *stream).await
    }

    pub async fn flush(&self) -> Result<()> {
        let cookie = self.cookie();
        let mut stream = self.stream.lock().await;
        send_request(&mut *stream, NBD_CMD_FLUSH, 0, cookie, 0, 0, None).await?;
        read_simple_ack(&mut *stream).await
    }

    /// Queries `base:allocation` (or a configured alternate context) block status for the whole
    /// `[offset, offset+length)` range, retrying on short server-side coverage until the full
    /// range has been accounted for.
    pub async fn block_status(&self, offset: u64, length: u64, context: &str) -> Result<Vec<Extent>> {
        self.check_range(offset, length)?;
        let context_id = *self
            .meta_context_ids
            .get(context)
            .ok_or_else(|| NbdError::MetaContextUnavailable(context.to_owned()))?;

        let mut extents = Vec::new();
        let mut cursor = offset;
        let end = offset + length;
        while cursor < end {
            let chunk_len = (end - cursor).min(u64::from(u32::MAX));
            let cookie = self.cookie();
            let mut stream = self.stream.lock().await;
            send_request(&mut *stream, NBD_CMD_BLOCK_STATUS, 0, cookie, cursor, chunk_len.try_into().unwrap_or(u32::MAX), None).await?;
            let chunk_extents = read_block_status_reply(&mut *stream, context_id, cursor).await?;
            drop(stream);

            if chunk_extents.is_empty() {
                return Err(NbdError::Protocol("server returned no block status entries"));
            }
            for extent in &chunk_extents {
                cursor = cursor.max(extent.start + extent.length);
            }
            extents.extend(chunk_extents);
        }
        Ok(merge_extents(extents))
    }

    pub async fn disconnect(&self) -> Result<()> {
        let cookie = self.cookie();
        let mut stream = self.stream.lock().await;
        send_request(&mut *stream, NBD_CMD_DISC, 0, cookie, 0, 0, None).await?;
        Ok(())
    }
}

fn merge_extents(mut extents: Vec<Extent>) -> Vec<Extent> {
    extents.sort_by_key(|e| e.start);
    let mut merged: Vec<Extent> = Vec::with_capacity(extents.len());
    for extent in extents {
        match merged.last_mut() {
            Some(prev) if prev.start + prev.length == extent.start && prev.zero == extent.zero && prev.hole == extent.hole => {
                prev.length += extent.length;
            }
            _ => merged.push(extent),
        }
    }
    merged
}

async fn send_option<S: Stream + ?Sized>(stream: &mut S, option: u32, data: &[u8]) -> Result<()> {
    stream.write_all(&IHAVEOPT.to_be_bytes()).await?;
    stream.write_all(&option.to_be_bytes()).await?;
    stream.write_all(&(data.len() as u32).to_be_bytes()).await?;
    if !data.is_empty() {
        stream.write_all(data).await?;
    }
    Ok(())
}

/// Reads one option-reply header plus its payload. Caller loops for multi-reply options.
async fn read_option_reply<S: Stream + ?Sized>(stream: &mut S, expect_option: u32) -> Result<(u32, Vec<u8>)> {
    let mut header = [0u8; 8 + 4 + 4 + 4];
    read_exact_retrying(stream, &mut header).await?;
    let magic = u64::from_be_bytes(header[0..8].try_into().expect("8 bytes"));
    if magic != OPT_REPLY_MAGIC {
        return Err(NbdError::Protocol("bad option reply magic"));
    }
    let option = u32::from_be_bytes(header[8..12].try_into().expect("4 bytes"));
    if option != expect_option {
        return Err(NbdError::Protocol("option reply for unexpected option"));
    }
    let reply_type = u32::from_be_bytes(header[12..16].try_into().expect("4 bytes"));
    let len = u32::from_be_bytes(header[16..20].try_into().expect("4 bytes")) as usize;
    let mut payload = vec![0u8; len];
    if len > 0 {
        read_exact_retrying(stream, &mut payload).await?;
    }
    Ok((reply_type, payload))
}

async fn negotiate_meta_contexts<S: Stream + ?Sized>(
    stream: &mut S,
    export: &str,
    queries: &[String],
    out: &mut HashMap<String, u32>,
) -> Result<()> {
    let mut data = Vec::new();
    data.extend_from_slice(&(export.len() as u32).to_be_bytes());
    data.extend_from_slice(export.as_bytes());
    data.extend_from_slice(&(queries.len() as u32).to_be_bytes());
    for query in queries {
        data.extend_from_slice(&(query.len() as u32).to_be_bytes());
        data.extend_from_slice(query.as_bytes());
    }
    send_option(stream, NBD_OPT_SET_META_CONTEXT, &data).await?;

    loop {
        let (reply_type, payload) = read_option_reply(stream, NBD_OPT_SET_META_CONTEXT).await?;
        match reply_type {
            NBD_REP_META_CONTEXT => {
                if payload.len() < 4 {
                    return Err(NbdError::Protocol("short meta context reply"));
                }
                let id = u32::from_be_bytes(payload[0..4].try_into().expect("4 bytes"));
                let name = String::from_utf8_lossy(&payload[4..]).into_owned();
                out.insert(name, id);
            }
            NBD_REP_ACK => break,
            code if code & NBD_REP_FLAG_ERROR != 0 => {
                // Server does not support the option at all; leave `out` empty and move on,
                // block_status() will surface MetaContextUnavailable on first use.
                break;
            }
            code => return Err(NbdError::OptionRejected { opt: NBD_OPT_SET_META_CONTEXT, code }),
        }
    }
    Ok(())
}

#[allow(clippy::too_many_arguments)]
async fn send_request<S: Stream + ?Sized>(
    stream: &mut S,
    command: u16,
    flags: u16,
    cookie: u64,
    offset: u64,
    length: u32,
    payload: Option<&[u8]>,
) -> Result<()> {
    let mut header = Vec::with_capacity(28);
    header.extend_from_slice(&NBD_REQUEST_MAGIC.to_be_bytes());
    header.extend_from_slice(&flags.to_be_bytes());
    header.extend_from_slice(&command.to_be_bytes());
    header.extend_from_slice(&cookie.to_be_bytes());
    header.extend_from_slice(&offset.to_be_bytes());
    header.extend_from_slice(&length.to_be_bytes());
    stream.write_all(&header).await?;
    if let Some(payload) = payload {
        stream.write_all(payload).await?;
    }
    Ok(())
}

async fn read_simple_ack<S: Stream + ?Sized>(stream: &mut S) -> Result<()> {
    let magic = read_reply_magic(stream).await?;
    if magic == NBD_SIMPLE_REPLY_MAGIC {
        let mut rest = [0u8; 4 + 8];
        read_exact_retrying(stream, &mut rest).await?;
        let error = u32::from_be_bytes(rest[0..4].try_into().expect("4 bytes"));
        if error != 0 {
            return Err(NbdError::CommandError(error));
        }
        Ok(())
    } else if magic == NBD_STRUCTURED_REPLY_MAGIC {
        let chunk = read_structured_chunk_header(stream).await?;
        if chunk.chunk_type == NBD_REPLY_TYPE_NONE {
            if chunk.flags & NBD_REPLY_FLAG_DONE == 0 {
                return Err(NbdError::Protocol("NBD_REPLY_TYPE_NONE without done flag"));
            }
            Ok(())
        } else if chunk.chunk_type == NBD_REPLY_TYPE_ERROR || chunk.chunk_type == NBD_REPLY_TYPE_ERROR_OFFSET {
            let error = read_structured_error(stream, chunk.length).await?;
            Err(NbdError::CommandError(error))
        } else {
            Err(NbdError::Protocol("unexpected structured chunk type for ack"))
        }
    } else {
        Err(NbdError::Protocol("bad reply magic"))
    }
}

struct ChunkHeader {
    flags: u16,
    chunk_type: u16,
    length: u32,
}

async fn read_reply_magic<S: Stream + ?Sized>(stream: &mut S) -> Result<u32> {
    let mut buf = [0u8; 4];
    read_exact_retrying(stream, &mut buf).await?;
    Ok(u32::from_be_bytes(buf))
}

async fn read_structured_chunk_header<S: Stream + ?Sized>(stream: &mut S) -> Result<ChunkHeader> {
    let mut buf = [0u8; 2 + 2 + 8 + 4];
    read_exact_retrying(stream, &mut buf).await?;
    let flags = u16::from_be_bytes(buf[0..2].try_into().expect("2 bytes"));
    let chunk_type = u16::from_be_bytes(buf[2..4].try_into().expect("2 bytes"));
    // bytes [4..12] are the echoed cookie; we trust pipelining-free usage and skip matching it.
    let length = u32::from_be_bytes(buf[12..16].try_into().expect("4 bytes"));
    Ok(ChunkHeader { flags, chunk_type, length })
}

async fn read_structured_error<S: Stream + ?Sized>(stream: &mut S, length: u32) -> Result<u32> {
    let mut buf = vec![0u8; length as usize];
    read_exact_retrying(stream, &mut buf).await?;
    if buf.len() < 4 {
        return Err(NbdError::Protocol("short structured error chunk"));
    }
    Ok(u32::from_be_bytes(buf[0..4].try_into().expect("4 bytes")))
}

async fn read_structured_data_reply<S: Stream + ?Sized>(stream: &mut S, request_offset: u64, dst: &mut [u8]) -> Result<()> {
    let magic = read_reply_magic(stream).await?;
    if magic == NBD_SIMPLE_REPLY_MAGIC {
        let mut rest = [0u8; 4 + 8];
        read_exact_retrying(stream, &mut rest).await?;
        let error = u32::from_be_bytes(rest[0..4].try_into().expect("4 bytes"));
        if error != 0 {
            return Err(NbdError::CommandError(error));
        }
        read_exact_retrying(stream, dst).await?;
        return Ok(());
    }
    if magic != NBD_STRUCTURED_REPLY_MAGIC {
        return Err(NbdError::Protocol("bad reply magic"));
    }

    dst.fill(0);
    loop {
        let chunk = read_structured_chunk_header(stream).await?;
        match chunk.chunk_type {
            NBD_REPLY_TYPE_NONE => {
                if chunk.flags & NBD_REPLY_FLAG_DONE != 0 {
                    return Ok(());
                }
            }
            NBD_REPLY_TYPE_OFFSET_DATA => {
                let mut offset_buf = [0u8; 8];
                read_exact_retrying(stream, &mut offset_buf).await?;
                let chunk_offset = u64::from_be_bytes(offset_buf);
                let data_len = chunk.length as usize - 8;
                let start = (chunk_offset - request_offset) as usize;
                if start + data_len > dst.len() {
                    return Err(NbdError::Protocol("data chunk overruns requested range"));
                }
                read_exact_retrying(stream, &mut dst[start..start + data_len]).await?;
                if chunk.flags & NBD_REPLY_FLAG_DONE != 0 {
                    return Ok(());
                }
            }
            NBD_REPLY_TYPE_OFFSET_HOLE => {
                let mut hole_buf = [0u8; 8 + 4];
                read_exact_retrying(stream, &mut hole_buf).await?;
                let chunk_offset = u64::from_be_bytes(hole_buf[0..8].try_into().expect("8 bytes"));
                let hole_len = u32::from_be_bytes(hole_buf[8..12].try_into().expect("4 bytes")) as usize;
                let start = (chunk_offset - request_offset) as usize;
                if start + hole_len > dst.len() {
                    return Err(NbdError::Protocol("hole chunk overruns requested range"));
                }
                // Already zero-filled above; nothing further to copy.
                if chunk.flags & NBD_REPLY_FLAG_DONE != 0 {
                    return Ok(());
                }
            }
            NBD_REPLY_TYPE_ERROR | NBD_REPLY_TYPE_ERROR_OFFSET => {
                let error = read_structured_error(stream, chunk.length).await?;
                return Err(NbdError::CommandError(error));
            }
            _ => {
                let mut skip = vec![0u8; chunk.length as usize];
                read_exact_retrying(stream, &mut skip).await?;
                if chunk.flags & NBD_REPLY_FLAG_DONE != 0 {
                    return Ok(());
                }
            }
        }
    }
}

async fn read_block_status_reply<S: Stream + ?Sized>(stream: &mut S, expect_context_id: u32, base_offset: u64) -> Result<Vec<Extent>> {
    let magic = read_reply_magic(stream).await?;
    if magic != NBD_STRUCTURED_REPLY_MAGIC {
        return Err(NbdError::Protocol("block status requires structured replies"));
    }

    let mut extents = Vec::new();
    loop {
        let chunk = read_structured_chunk_header(stream).await?;
        match chunk.chunk_type {
            NBD_REPLY_TYPE_NONE => {
                if chunk.flags & NBD_REPLY_FLAG_DONE != 0 {
                    return Ok(extents);
                }
            }
            NBD_REPLY_TYPE_BLOCK_STATUS => {
                let mut body = vec![0u8; chunk.length as usize];
                read_exact_retrying(stream, &mut body).await?;
                if body.len() < 4 {
                    return Err(NbdError::Protocol("short block status chunk"));
                }
                let context_id = u32::from_be_bytes(body[0..4].try_into().expect("4 bytes"));
                if context_id != expect_context_id {
                    if chunk.flags & NBD_REPLY_FLAG_DONE != 0 {
                        return Ok(extents);
                    }
                    continue;
                }
                let mut cursor = 4usize;
                let mut offset = base_offset;
                while cursor + 8 <= body.len() {
                    let length = u32::from_be_bytes(body[cursor..cursor + 4].try_into().expect("4 bytes"));
                    let flags = u32::from_be_bytes(body[cursor + 4..cursor + 8].try_into().expect("4 bytes"));
                    extents.push(Extent {
                        start: offset,
                        length: u64::from(length),
                        zero: flags & NBD_STATE_ZERO != 0,
                        hole: flags & NBD_STATE_HOLE != 0,
                        dirty: None,
                    });
                    offset += u64::from(length);
                    cursor += 8;
                }
                if chunk.flags & NBD_REPLY_FLAG_DONE != 0 {
                    return Ok(extents);
                }
            }
            NBD_REPLY_TYPE_ERROR | NBD_REPLY_TYPE_ERROR_OFFSET => {
                let error = read_structured_error(stream, chunk.length).await?;
                return Err(NbdError::CommandError(error));
            }
            _ => {
                let mut skip = vec![0u8; chunk.length as usize];
                read_exact_retrying(stream, &mut skip).await?;
                if chunk.flags & NBD_REPLY_FLAG_DONE != 0 {
                    return Ok(extents);
                }
            }
        }
    }
}

/// `read_exact` wrapper that retries on `Interrupted`, which NBD servers behind signal-heavy
/// hypervisor stacks have been observed to surface on block-status calls.
async fn read_exact_retrying<S: Stream + ?Sized>(stream: &mut S, buf: &mut [u8]) -> Result<()> {
    loop {
        match stream.read_exact(buf).await {
            Ok(_) => return Ok(()),
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn extent(start: u64, length: u64, zero: bool, hole: bool) -> Extent {
        Extent { start, length, zero, hole, dirty: None }
    }

    #[test]
    fn merge_extents_joins_adjacent_same_flags() {
        let input = vec![extent(0, 10, false, false), extent(10, 10, false, false), extent(20, 5, true, false)];
        let merged = merge_extents(input);
        assert_eq!(merged, vec![extent(0, 20, false, false), extent(20, 5, true, false)]);
    }

    #[test]
    fn merge_extents_keeps_differing_flags_separate() {
        let input = vec![extent(0, 10, false, false), extent(10, 10, true, false)];
        let merged = merge_extents(input);
        assert_eq!(merged.len(), 2);
    }

    #[test]
    fn merge_extents_sorts_out_of_order_input() {
        let input = vec![extent(20, 5, false, false), extent(0, 20, false, false)];
        let merged = merge_extents(input);
        assert_eq!(merged, vec![extent(0, 25, false, false)]);
    }
}
