use regex::Regex;

/// Parses window-title control sequences out of the output stream.
///
/// Recognizes `ESC ] 0;title BEL`, `ESC ] 2;title BEL` and the ST-terminated
/// forms. Only a title containing a plausible `user@host` is surfaced, which
/// keeps prompt noise from flapping the tab label.
pub struct TitleDetector {
    osc_title: Regex,
    user_host: Regex,
    last_title: Option<String>,
}

impl TitleDetector {
    pub fn new() -> Self {
        let osc_title = Regex::new(r"\x1b\](?:0|2);([^\x07\x1b]*?)(?:\x07|\x1b\\)")
            .expect("static regex");
        let user_host = Regex::new(r"\b([a-zA-Z0-9_-]{2,50})@([a-zA-Z0-9._-]{1,50})\b")
            .expect("static regex");

        Self {
            osc_title,
            user_host,
            last_title: None,
        }
    }

    /// Feed an output chunk; returns a new title when one was announced and
    /// differs from the last one seen.
    pub fn process_output(&mut self, data: &[u8]) -> Option<String> {
        let text = String::from_utf8_lossy(data);
        let raw_title = self.extract_osc_title(&text)?;
        let title = self.extract_user_host(&raw_title)?;

        if self.last_title.as_deref() == Some(title.as_str()) {
            return None;
        }
        self.last_title = Some(title.clone());
        Some(title)
    }

    fn extract_osc_title(&self, text: &str) -> Option<String> {
        let captures = self.osc_title.captures(text)?;
        let title = captures.get(1)?.as_str().trim();
        if title.is_empty() {
            None
        } else {
            Some(title.to_string())
        }
    }

    fn extract_user_host(&self, text: &str) -> Option<String> {
        let captures = self.user_host.captures(text)?;
        let user = captures.get(1)?.as_str();
        let host = captures.get(2)?.as_str();

        // An all-numeric "host" is usually an IP fragment, not a hostname.
        if host.chars().all(|c| c.is_ascii_digit() || c == '.') {
            return None;
        }

        Some(format!("{}@{}", user, host))
    }
}

impl Default for TitleDetector {
    fn default() -> Self {
        Self::new()
    }
}

/// Fallback title for local sessions that never announce one.
pub fn default_local_title() -> String {
    let user = std::env::var("USER")
        .or_else(|_| std::env::var("USERNAME"))
        .unwrap_or_else(|_| "user".to_string());
    let host = gethostname::gethostname().to_string_lossy().to_string();
    format!("{}@{}", user, host)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bel_terminated_title() {
        let mut detector = TitleDetector::new();
        let title = detector.process_output(b"\x1b]0;alice@buildbox: ~\x07");
        assert_eq!(title.as_deref(), Some("alice@buildbox"));
    }

    #[test]
    fn st_terminated_title() {
        let mut detector = TitleDetector::new();
        let title = detector.process_output(b"\x1b]2;bob@web-1\x1b\\");
        assert_eq!(title.as_deref(), Some("bob@web-1"));
    }

    #[test]
    fn repeated_title_is_suppressed() {
        let mut detector = TitleDetector::new();
        assert!(detector.process_output(b"\x1b]0;alice@host\x07").is_some());
        assert!(detector.process_output(b"\x1b]0;alice@host\x07").is_none());
    }

    #[test]
    fn plain_output_yields_nothing() {
        let mut detector = TitleDetector::new();
        assert!(detector.process_output(b"ls -la\ntotal 0\n").is_none());
    }

    #[test]
    fn ip_fragment_is_rejected() {
        let mut detector = TitleDetector::new();
        assert!(detector.process_output(b"\x1b]0;ping 10@0.0.1\x07").is_none());
    }
}
