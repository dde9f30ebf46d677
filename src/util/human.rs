/// Format a span of seconds compactly: "40s", "1m30s", "2h0m0s"
pub fn fmt_secs(secs: u64) -> String {
    let h = secs / 3600;
    let m = (secs % 3600) / 60;
    let s = secs % 60;
    if h > 0      { format!("{}h{}m{}s", h, m, s) }
    else if m > 0 { format!("{}m{}s", m, s) }
    else          { format!("{}s", s) }
}

/// Format a count with thousands separators: "1,247"
pub fn fmt_count(n: u64) -> String {
    let digits = n.to_string();
    let mut out = String::with_capacity(digits.len() + digits.len() / 3);
    for (i, ch) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            out.push(',');
        }
        out.push(ch);
    }
    out
}
