//! On-the-fly USTAR framing.
//!
//! [`TarStream`] wraps a byte stream and a `(name, size)` pair as a readable
//! stream emitting a valid USTAR archive holding exactly one regular file:
//! a 512-byte header, `size` content bytes, zero padding to the next 512-byte
//! boundary, and two 512-byte zero blocks. The container and pod transports
//! pipe this into their respective extract operations.

use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, ReadBuf};

pub const BLOCK_SIZE: usize = 512;
const TERMINATOR_SIZE: u64 = 2 * BLOCK_SIZE as u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Header,
    Content,
    Padding,
    Terminator,
    Done,
}

/// A single-file USTAR archive as a readable stream.
pub struct TarStream<R> {
    inner: R,
    header: [u8; BLOCK_SIZE],
    size: u64,
    phase: Phase,
    /// Bytes already emitted from the current non-content phase.
    phase_emitted: u64,
    /// Content bytes read from the inner stream so far.
    content_read: u64,
}

impl<R> TarStream<R> {
    /// Frame `inner` as `name` with exactly `size` content bytes. Names
    /// longer than 100 bytes are truncated, as the header format requires.
    pub fn new(inner: R, name: &str, size: u64) -> Self {
        Self {
            inner,
            header: build_header(name, size),
            size,
            phase: Phase::Header,
            phase_emitted: 0,
            content_read: 0,
        }
    }
}

/// Total archive length for a given content size.
pub fn framed_len(size: u64) -> u64 {
    BLOCK_SIZE as u64 + size + pad_len(size) + TERMINATOR_SIZE
}

/// Zero bytes needed after `size` content bytes to reach a block boundary.
pub fn pad_len(size: u64) -> u64 {
    (BLOCK_SIZE as u64 - size % BLOCK_SIZE as u64) % BLOCK_SIZE as u64
}

fn build_header(name: &str, size: u64) -> [u8; BLOCK_SIZE] {
    let mut header = [0u8; BLOCK_SIZE];
    let name_bytes = name.as_bytes();
    let name_len = name_bytes.len().min(100);
    header[0..name_len].copy_from_slice(&name_bytes[..name_len]);
    header[100..108].copy_from_slice(b"0000644\0");
    header[108..116].copy_from_slice(b"0000000\0");
    header[116..124].copy_from_slice(b"0000000\0");
    write_octal(&mut header[124..136], size);
    let mtime = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs())
        .unwrap_or(0);
    write_octal(&mut header[136..148], mtime);
    // checksum is computed over the header with its own field as spaces
    header[148..156].fill(b' ');
    header[156] = b'0';
    header[257..263].copy_from_slice(b"ustar\0");
    header[263..265].copy_from_slice(b"00");
    let sum: u32 = header.iter().map(|&byte| byte as u32).sum();
    let checksum = format!("{sum:06o}\0 ");
    header[148..156].copy_from_slice(checksum.as_bytes());
    header
}

/// 11 octal digits followed by NUL, into a 12-byte field.
fn write_octal(field: &mut [u8], value: u64) {
    let text = format!("{value:011o}\0");
    field.copy_from_slice(text.as_bytes());
}

impl<R: AsyncRead + Unpin> AsyncRead for TarStream<R> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        let this = self.get_mut();
        loop {
            match this.phase {
                Phase::Header => {
                    emit_slice(&this.header, &mut this.phase_emitted, buf);
                    if this.phase_emitted == BLOCK_SIZE as u64 {
                        this.phase = Phase::Content;
                        this.phase_emitted = 0;
                    }
                    return Poll::Ready(Ok(()));
                }
                Phase::Content => {
                    let remaining = this.size - this.content_read;
                    if remaining == 0 {
                        this.phase = Phase::Padding;
                        continue;
                    }
                    if buf.remaining() == 0 {
                        return Poll::Ready(Ok(()));
                    }
                    let limit = remaining.min(buf.remaining() as u64) as usize;
                    let mut limited = buf.take(limit);
                    match Pin::new(&mut this.inner).poll_read(cx, &mut limited) {
                        Poll::Pending => return Poll::Pending,
                        Poll::Ready(Err(error)) => return Poll::Ready(Err(error)),
                        Poll::Ready(Ok(())) => {}
                    }
                    let filled = limited.filled().len();
                    if filled == 0 {
                        return Poll::Ready(Err(std::io::Error::new(
                            std::io::ErrorKind::UnexpectedEof,
                            format!(
                                "source ended prematurely: expected {} content bytes, read {}",
                                this.size, this.content_read
                            ),
                        )));
                    }
                    // SAFETY: the bytes were initialized by the inner read
                    // into a view of this buffer
                    unsafe { buf.assume_init(filled) };
                    buf.advance(filled);
                    this.content_read += filled as u64;
                    return Poll::Ready(Ok(()));
                }
                Phase::Padding => {
                    let pad = pad_len(this.size);
                    if this.phase_emitted == pad {
                        this.phase = Phase::Terminator;
                        this.phase_emitted = 0;
                        continue;
                    }
                    emit_zeros(pad, &mut this.phase_emitted, buf);
                    return Poll::Ready(Ok(()));
                }
                Phase::Terminator => {
                    if this.phase_emitted == TERMINATOR_SIZE {
                        this.phase = Phase::Done;
                        continue;
                    }
                    emit_zeros(TERMINATOR_SIZE, &mut this.phase_emitted, buf);
                    return Poll::Ready(Ok(()));
                }
                Phase::Done => return Poll::Ready(Ok(())),
            }
        }
    }
}

fn emit_slice(source: &[u8], cursor: &mut u64, buf: &mut ReadBuf<'_>) {
    let start = *cursor as usize;
    let count = (source.len() - start).min(buf.remaining());
    buf.put_slice(&source[start..start + count]);
    *cursor += count as u64;
}

fn emit_zeros(total: u64, cursor: &mut u64, buf: &mut ReadBuf<'_>) {
    const ZEROS: [u8; BLOCK_SIZE] = [0u8; BLOCK_SIZE];
    let count = ((total - *cursor) as usize).min(buf.remaining()).min(BLOCK_SIZE);
    buf.put_slice(&ZEROS[..count]);
    *cursor += count as u64;
}
