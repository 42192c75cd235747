//! Control-channel codec.
//!
//! Frames are self-delimited byte strings separated by the three-byte
//! sequence `0x01 0x00 0x00`. Within a frame, pairs are `key=value`,
//! NUL-terminated, with `=` as the first separator in each pair (so values
//! may themselves contain `=`). This framing is wire-exact: no other module
//! may hardcode the delimiter or pair-separator bytes.

use std::io;
use std::os::fd::RawFd;

/// Frame delimiter. Never appears inside a well-formed pair because values
/// are scrubbed of embedded NUL before being encoded (see `worker::finish_job`).
pub const FRAME_DELIM: &[u8] = &[0x01, 0x00, 0x00];

/// Byte that both terminates a pair and separates key from value's sibling pairs.
const PAIR_TERMINATOR: u8 = 0x00;

/// One `(key, value)` pair as raw bytes. Order is significant; keys need not be unique.
pub type Kv = (Vec<u8>, Vec<u8>);

/// An ordered sequence of pairs decoded from, or to be encoded into, one frame.
pub type KvVec = Vec<Kv>;

/// Serialize a key-value vector and append the frame delimiter.
pub fn encode(kv: &[Kv]) -> Vec<u8> {
    let mut out = Vec::with_capacity(kv.iter().map(|(k, v)| k.len() + v.len() + 2).sum());
    for (key, value) in kv {
        out.extend_from_slice(key);
        out.push(b'=');
        out.extend_from_slice(value);
        out.push(PAIR_TERMINATOR);
    }
    out.extend_from_slice(FRAME_DELIM);
    out
}

/// Scan `buf` for complete frames, decoding each into a `KvVec`.
///
/// Returns the decoded frames in order and the number of leading bytes of
/// `buf` they were consumed from. The caller drains exactly that many bytes
/// and retains the remainder (a partial, not-yet-delimited frame) for the
/// next call.
pub fn decode(buf: &[u8]) -> (Vec<KvVec>, usize) {
    let mut frames = Vec::new();
    let mut consumed = 0usize;
    loop {
        let rest = &buf[consumed..];
        match find_delim(rest) {
            Some(idx) => {
                frames.push(decode_frame(&rest[..idx]));
                consumed += idx + FRAME_DELIM.len();
            }
            None => break,
        }
    }
    (frames, consumed)
}

fn find_delim(buf: &[u8]) -> Option<usize> {
    if buf.len() < FRAME_DELIM.len() {
        return None;
    }
    buf.windows(FRAME_DELIM.len()).position(|w| w == FRAME_DELIM)
}

/// Decode the pairs inside one already-delimited frame.
///
/// Malformed pairs (no `=`) yield a key with an empty value rather than
/// being rejected, per spec: the codec is lenient by design.
fn decode_frame(bytes: &[u8]) -> KvVec {
    let mut kv = Vec::new();
    let mut start = 0usize;
    for (i, &b) in bytes.iter().enumerate() {
        if b == PAIR_TERMINATOR {
            if i > start {
                kv.push(decode_pair(&bytes[start..i]));
            }
            start = i + 1;
        }
    }
    // A pair with no trailing NUL before the delimiter is still accepted.
    if start < bytes.len() {
        kv.push(decode_pair(&bytes[start..]));
    }
    kv
}

fn decode_pair(chunk: &[u8]) -> Kv {
    match chunk.iter().position(|&b| b == b'=') {
        Some(pos) => (chunk[..pos].to_vec(), chunk[pos + 1..].to_vec()),
        None => (chunk.to_vec(), Vec::new()),
    }
}

/// Encode `kv` and write it in a single `write(2)` call, per spec.md §4.1.
/// Short writes are not retried: correctness on the master-write path relies
/// on the socket's send buffer, exactly as spec.md §5 describes. Returns the
/// underlying I/O error on failure; callers treat a broken-pipe error as
/// fatal.
pub fn send_kv(fd: RawFd, kv: &[Kv]) -> io::Result<()> {
    let bytes = encode(kv);
    let n = unsafe { libc::write(fd, bytes.as_ptr() as *const libc::c_void, bytes.len()) };
    if n < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// True if `err` represents the broken-pipe condition the spec calls out as
/// fatal for the master-write path (distinct from a protocol-level error).
pub fn is_broken_pipe(err: &io::Error) -> bool {
    err.kind() == io::ErrorKind::BrokenPipe || err.raw_os_error() == Some(libc::EPIPE)
}

/// Send a single-pair `log=<message>` frame, per spec.md §4.1: the only
/// diagnostic path the master itself observes, using the same framing as
/// every other message on this socket.
pub fn send_log(fd: RawFd, message: &str) -> io::Result<()> {
    send_kv(fd, &[(b"log".to_vec(), message.as_bytes().to_vec())])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kv(pairs: &[(&str, &str)]) -> KvVec {
        pairs
            .iter()
            .map(|(k, v)| (k.as_bytes().to_vec(), v.as_bytes().to_vec()))
            .collect()
    }

    #[test]
    fn encode_then_decode_roundtrips() {
        let input = kv(&[("command", "/bin/echo hi"), ("job_id", "7"), ("timeout", "10")]);
        let bytes = encode(&input);
        let (frames, consumed) = decode(&bytes);
        assert_eq!(consumed, bytes.len());
        assert_eq!(frames, vec![input]);
    }

    #[test]
    fn decode_then_encode_is_byte_identical() {
        let input = kv(&[("command", "sh -c 'echo a=b'"), ("job_id", "1")]);
        let bytes = encode(&input);
        let (frames, consumed) = decode(&bytes);
        assert_eq!(consumed, bytes.len());
        let re_encoded = encode(&frames[0]);
        assert_eq!(re_encoded, bytes);
    }

    #[test]
    fn value_may_contain_equals_sign() {
        let input = kv(&[("env", "HOME=/root"), ("command", "true")]);
        let bytes = encode(&input);
        let (frames, _) = decode(&bytes);
        assert_eq!(frames[0][0], (b"env".to_vec(), b"HOME=/root".to_vec()));
    }

    #[test]
    fn malformed_pair_without_equals_yields_empty_value() {
        let mut bytes = b"job_id".to_vec();
        bytes.push(0);
        bytes.extend_from_slice(FRAME_DELIM);
        let (frames, consumed) = decode(&bytes);
        assert_eq!(consumed, bytes.len());
        assert_eq!(frames[0], vec![(b"job_id".to_vec(), Vec::new())]);
    }

    #[test]
    fn partial_frame_is_not_consumed() {
        let mut bytes = encode(&kv(&[("a", "1")]));
        bytes.extend_from_slice(b"b=2\0"); // partial second frame, no delimiter yet
        let (frames, consumed) = decode(&bytes);
        assert_eq!(frames.len(), 1);
        assert!(consumed < bytes.len());
        assert_eq!(&bytes[consumed..], b"b=2\0");
    }

    #[test]
    fn multiple_frames_in_one_buffer() {
        let mut bytes = encode(&kv(&[("a", "1")]));
        bytes.extend_from_slice(&encode(&kv(&[("b", "2")])));
        let (frames, consumed) = decode(&bytes);
        assert_eq!(consumed, bytes.len());
        assert_eq!(frames.len(), 2);
    }

    #[test]
    fn empty_buffer_decodes_to_nothing() {
        let (frames, consumed) = decode(&[]);
        assert!(frames.is_empty());
        assert_eq!(consumed, 0);
    }
}
