use tokio::io::{AsyncRead, AsyncReadExt};

use crate::error::{NagareError, NagareResult};

/// Fill `buf` completely, or report a clean end of stream.
///
/// Returns `Ok(false)` only when EOF falls exactly on a record boundary
/// (zero bytes read). EOF in the middle of `buf` is a truncation error.
pub(crate) async fn read_exact_or_eof<R>(reader: &mut R, buf: &mut [u8]) -> NagareResult<bool>
where
    R: AsyncRead + Unpin,
{
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..]).await?;
        if n == 0 {
            if filled == 0 {
                return Ok(false);
            }
            return Err(NagareError::TruncatedBox);
        }
        filled += n;
    }
    Ok(true)
}

/// Current wall clock as Unix milliseconds.
pub(crate) fn unix_millis() -> u64 {
    chrono::Utc::now().timestamp_millis().max(0) as u64
}
