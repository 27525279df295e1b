/// Substrings stripped from every free-text field before validation.
/// Matching is ASCII case-insensitive.
const DENYLIST: [&str; 5] = ["content-type", "bcc:", "to:", "cc:", "href"];

/// Remove every denylisted marker from `input` and trim the result.
///
/// Removal repeats until no marker is left, so input like `tto:o:` cannot
/// reassemble a marker out of the pieces that remain. Text outside the
/// markers keeps its case.
pub fn clean(input: &str) -> String {
    let mut text = input.to_string();
    loop {
        let before = text.len();
        for marker in DENYLIST {
            text = strip_marker(&text, marker);
        }
        if text.len() == before {
            break;
        }
    }
    text.trim().to_string()
}

fn strip_marker(text: &str, marker: &str) -> String {
    let haystack = text.as_bytes();
    let needle = marker.as_bytes();
    let mut out = String::with_capacity(text.len());
    let mut kept_from = 0;
    let mut pos = 0;

    // Markers are ASCII, so a match always starts and ends on a char boundary.
    while pos + needle.len() <= haystack.len() {
        if haystack[pos..pos + needle.len()].eq_ignore_ascii_case(needle) {
            out.push_str(&text[kept_from..pos]);
            pos += needle.len();
            kept_from = pos;
        } else {
            pos += 1;
        }
    }
    out.push_str(&text[kept_from..]);
    out
}
