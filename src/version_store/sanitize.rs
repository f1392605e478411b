/// Strips control characters (`0x00`-`0x1f`) from a commit message, keeping
/// newlines (`spec.md` §4.4). Only that literal byte range is stripped; DEL
/// (`0x7f`) and the C1 block (`0x80`-`0x9f`) are left alone, unlike
/// `char::is_control`.
pub fn sanitize_commit_message(raw: &str) -> String {
    raw.chars()
        .filter(|c| *c == '\n' || !matches!(*c, '\u{0}'..='\u{1f}'))
        .collect()
}

pub fn auto_message(text: &str) -> String {
    format!("auto: {}", sanitize_commit_message(text))
}

pub fn user_message(text: &str) -> String {
    format!("user: {}", sanitize_commit_message(text))
}
