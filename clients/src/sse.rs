//! Server-Sent Events framing for the notification feed.

/// Frames larger than this (still unterminated) abort the stream.
pub(crate) const MAX_BUFFERED_BYTES: usize = 4 * 1024 * 1024;

/// Consecutive undecodable payloads tolerated before the stream is abandoned.
pub(crate) const MAX_BAD_PAYLOADS: usize = 3;

/// Position and width of the earliest blank-line terminator in `buffer`.
fn terminator(buffer: &[u8]) -> Option<(usize, usize)> {
    (0..buffer.len()).find_map(|at| {
        let rest = &buffer[at..];
        if rest.starts_with(b"\n\n") {
            Some((at, 2))
        } else if rest.starts_with(b"\r\n\r\n") {
            Some((at, 4))
        } else {
            None
        }
    })
}

/// Removes one complete frame from the front of `buffer`, leaving any partial tail.
pub(crate) fn take_frame(buffer: &mut Vec<u8>) -> Option<Vec<u8>> {
    let (end, width) = terminator(buffer)?;
    let mut frame: Vec<u8> = buffer.drain(..end + width).collect();
    frame.truncate(end);
    Some(frame)
}

/// The `data:` payload of a frame, multi-line data joined with `\n`.
///
/// Frames with no `data:` field (keep-alive comments, bare `event:` lines) yield `None`.
pub(crate) fn frame_data(frame: &str) -> Option<String> {
    let fields: Vec<&str> = frame
        .split('\n')
        .map(|line| line.trim_end_matches('\r'))
        .filter_map(|line| line.strip_prefix("data:"))
        .map(|value| value.strip_prefix(' ').unwrap_or(value))
        .collect();
    (!fields.is_empty()).then(|| fields.join("\n"))
}
