//! Purpose: Turn an inbound request body into the exact payload handed to the plugin.
//! Exports: `BodyReadMode`, `read_body`, `read_single`, `read_complete`.
//! Role: Request-local ingestion; no shared state, no locking.
//! Invariants: Single-read output length always equals the declared length (absent = 0).
//! Invariants: Single-read never re-reads; positions past what one read delivered stay zero.
//! Invariants: Complete mode reads until the declared length or EOF and reports shortfalls.

use tokio::io::{AsyncRead, AsyncReadExt};

use crate::core::error::{Error, ErrorKind};

/// How much effort the host spends filling the declared-length buffer.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum BodyReadMode {
    /// One read attempt into a zero-filled buffer of the declared length.
    ///
    /// A stream that delivers its body across several reads leaves the tail of
    /// the buffer zero-filled instead of holding the real trailing bytes.
    #[default]
    SingleRead,
    /// Read until the declared length is filled; a shortfall is an error.
    Complete,
}

pub async fn read_body<R>(
    reader: &mut R,
    declared_len: Option<u64>,
    mode: BodyReadMode,
) -> Result<Vec<u8>, Error>
where
    R: AsyncRead + Unpin + ?Sized,
{
    match mode {
        BodyReadMode::SingleRead => read_single(reader, declared_len).await,
        BodyReadMode::Complete => read_complete(reader, declared_len).await,
    }
}

/// Allocate `declared_len` zero bytes and perform exactly one read into them.
///
/// Stream errors are absorbed: the buffer is returned as-is. The only error is a
/// declared length that cannot be allocated on this platform.
pub async fn read_single<R>(reader: &mut R, declared_len: Option<u64>) -> Result<Vec<u8>, Error>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut body = zeroed(declared_len.unwrap_or(0))?;
    if body.is_empty() {
        return Ok(body);
    }
    let result = reader.read(&mut body).await;
    match result {
        Ok(read) if read < body.len() => {
            tracing::debug!(
                declared = body.len(),
                read,
                "short body read; tail left zero-filled"
            );
        }
        Ok(_) => {}
        Err(err) => {
            tracing::debug!(declared = body.len(), error = %err, "body read failed");
        }
    }
    Ok(body)
}

/// Read until `declared_len` bytes have arrived, or to EOF when no length was declared.
pub async fn read_complete<R>(reader: &mut R, declared_len: Option<u64>) -> Result<Vec<u8>, Error>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let Some(declared_len) = declared_len else {
        let mut body = Vec::new();
        reader.read_to_end(&mut body).await.map_err(read_error)?;
        return Ok(body);
    };

    let mut body = zeroed(declared_len)?;
    let mut filled = 0;
    while filled < body.len() {
        let read = reader.read(&mut body[filled..]).await.map_err(read_error)?;
        if read == 0 {
            return Err(Error::new(ErrorKind::Usage)
                .with_message(format!(
                    "request body shorter than declared content length ({filled} of {declared_len} bytes)"
                ))
                .with_hint("Send the full body or correct the Content-Length header."));
        }
        filled += read;
    }
    Ok(body)
}

fn zeroed(len: u64) -> Result<Vec<u8>, Error> {
    let too_large = || {
        Error::new(ErrorKind::Usage)
            .with_message(format!("declared content length {len} cannot be allocated"))
    };
    let len = usize::try_from(len)
        .ok()
        .filter(|len| isize::try_from(*len).is_ok())
        .ok_or_else(too_large)?;
    // Zeroed allocation; pages are not touched until the read fills them.
    Ok(vec![0u8; len])
}

fn read_error(err: std::io::Error) -> Error {
    Error::new(ErrorKind::Io)
        .with_message("failed to read request body")
        .with_source(err)
}
