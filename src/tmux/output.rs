//! Control-mode `%output` notification decoding.
//!
//! tmux escapes bytes below ASCII 32 and the backslash itself as `\ooo`
//! octal sequences in `%output %<pane> <data>` lines.

/// Parse a `%output` line into its pane id and decoded payload.
pub fn parse_output_line(line: &str) -> Option<(&str, String)> {
    let rest = line.strip_prefix("%output ")?;
    let (pane, data) = rest.split_once(' ').unwrap_or((rest, ""));
    if !pane.starts_with('%') {
        return None;
    }
    Some((pane, decode_octal(data)))
}

/// Decode `\ooo` escapes into raw bytes, then into lossy UTF-8.
pub fn decode_octal(data: &str) -> String {
    let bytes = data.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\' && i + 3 < bytes.len() && is_octal_triplet(&bytes[i + 1..i + 4]) {
            let value = (bytes[i + 1] - b'0') as u16 * 64
                + (bytes[i + 2] - b'0') as u16 * 8
                + (bytes[i + 3] - b'0') as u16;
            out.push(value as u8);
            i += 4;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}

fn is_octal_triplet(digits: &[u8]) -> bool {
    digits.len() == 3
        && digits.iter().all(|d| (b'0'..=b'7').contains(d))
        && digits[0] <= b'3'
}
