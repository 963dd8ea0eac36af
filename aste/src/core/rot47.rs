//! rot47 obfuscation for passwords stored in config files.

/// Rotate printable ASCII (`!` to `~`) by 47 places; other characters are kept.
///
/// The transform is its own inverse.
pub fn rot47(text: &str) -> String {
    text.chars()
        .map(|c| match c {
            '!'..='~' => char::from(b'!' + ((c as u8 - b'!' + 47) % 94)),
            other => other,
        })
        .collect()
}
