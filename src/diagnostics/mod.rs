use crate::protocol::Frame;

const MAX_RENDERED_BYTES: usize = 64;

/// Renders a multipart message one frame per line, `[len] text` when the frame
/// is printable ASCII and `[len] hex` otherwise. Long frames are truncated.
pub fn dump_message(frames: &[Frame]) -> String {
    if frames.is_empty() {
        return "(empty message)".to_owned();
    }

    frames
        .iter()
        .map(|frame| format!("[{:03}] {}", frame.len(), render_frame(frame)))
        .collect::<Vec<_>>()
        .join("\n")
}

pub fn render_frame(frame: &[u8]) -> String {
    let shown = &frame[..frame.len().min(MAX_RENDERED_BYTES)];
    let ellipsis = if frame.len() > MAX_RENDERED_BYTES { "..." } else { "" };

    if shown.iter().all(|byte| (0x20..0x7f).contains(byte)) {
        format!("{}{ellipsis}", String::from_utf8_lossy(shown))
    } else {
        format!("{}{ellipsis}", hex::encode(shown))
    }
}
