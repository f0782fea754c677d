use serde::Serialize;
use serde::de::DeserializeOwned;
use std::future::Future;
use tokio::io::BufReader;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt};

pub const DEFAULT_MAX_LINE_BYTES: usize = 1024 * 1024;

/// Read the next non-blank, newline-terminated line.
///
/// Returns `Ok(None)` at EOF. A trailing fragment without a newline is never
/// returned: a peer that disconnects mid-message has not sent a message.
pub async fn read_line_with_limit<R>(
    reader: &mut R,
    max_bytes: usize,
) -> std::io::Result<Option<Vec<u8>>>
where
    R: AsyncBufRead + Unpin,
{
    let mut buf = Vec::new();
    loop {
        buf.clear();
        let n = reader.read_until(b'\n', &mut buf).await?;
        if n == 0 || buf.last() != Some(&b'\n') {
            return Ok(None);
        }
        if buf.len() > max_bytes {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!(
                    "json line exceeds max length ({} > {})",
                    buf.len(),
                    max_bytes
                ),
            ));
        }
        if buf.iter().all(|b| b.is_ascii_whitespace()) {
            continue;
        }
        return Ok(Some(buf));
    }
}

pub fn decode_json_line<T>(line: &[u8]) -> std::io::Result<T>
where
    T: DeserializeOwned,
{
    let s = std::str::from_utf8(line)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;

    serde_json::from_str::<T>(s.trim_end())
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
}

pub async fn read_json_line_with_limit<R, T>(
    reader: &mut R,
    max_bytes: usize,
) -> std::io::Result<Option<T>>
where
    R: AsyncBufRead + Unpin,
    T: DeserializeOwned,
{
    match read_line_with_limit(reader, max_bytes).await? {
        Some(line) => decode_json_line(&line).map(Some),
        None => Ok(None),
    }
}

pub async fn read_json_line<R, T>(reader: &mut R) -> std::io::Result<Option<T>>
where
    R: AsyncBufRead + Unpin,
    T: DeserializeOwned,
{
    read_json_line_with_limit(reader, DEFAULT_MAX_LINE_BYTES).await
}

pub async fn write_json_line<W, T>(writer: &mut W, value: &T) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let mut json = serde_json::to_vec(value)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    json.push(b'\n');
    writer.write_all(&json).await?;
    writer.flush().await?;
    Ok(())
}

/// Serve one connection: every parsed request line gets exactly one response
/// line, in order. Undecodable lines are answered with `invalid_response` and
/// the connection stays open.
pub async fn serve_jsonl_connection<S, Req, Resp, F, Fut, InvalidResp>(
    stream: S,
    handler: F,
    invalid_response: InvalidResp,
) -> std::io::Result<()>
where
    S: AsyncRead + AsyncWrite,
    Req: DeserializeOwned,
    Resp: Serialize,
    F: Fn(Req) -> Fut,
    Fut: Future<Output = Resp>,
    InvalidResp: Fn(std::io::Error) -> Resp,
{
    let (reader, mut writer) = tokio::io::split(stream);
    let mut reader = BufReader::new(reader);

    loop {
        let Some(req) = (match read_json_line::<_, Req>(&mut reader).await {
            Ok(v) => v,
            Err(e) if e.kind() == std::io::ErrorKind::InvalidData => {
                let resp = invalid_response(e);
                write_json_line(&mut writer, &resp).await?;
                continue;
            }
            Err(e) => return Err(e),
        }) else {
            break;
        };

        let resp = handler(req).await;
        write_json_line(&mut writer, &resp).await?;
    }

    Ok(())
}

/// Send one request and wait for the first decodable response line.
///
/// Lines that fail to decode are skipped. Returns `Ok(None)` if the peer
/// closes before answering.
pub async fn request_response<S, Req, Resp>(stream: S, req: &Req) -> std::io::Result<Option<Resp>>
where
    S: AsyncRead + AsyncWrite,
    Req: Serialize,
    Resp: DeserializeOwned,
{
    let (reader, mut writer) = tokio::io::split(stream);
    let mut reader = BufReader::new(reader);

    write_json_line(&mut writer, req).await?;

    while let Some(line) = read_line_with_limit(&mut reader, DEFAULT_MAX_LINE_BYTES).await? {
        if let Ok(resp) = decode_json_line::<Resp>(&line) {
            return Ok(Some(resp));
        }
    }
    Ok(None)
}
