/// Per-stream running text. Upstream chunks are additive: each token is
/// appended, and the delta is whatever lies past the last emitted length.
#[derive(Debug, Default, Clone)]
pub struct RunningResponse {
    full_text: String,
    last_emitted_len: usize,
}

impl RunningResponse {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends `token` and returns the not-yet-emitted suffix, or `None` when
    /// there is nothing new to send.
    pub fn apply(&mut self, token: &str) -> Option<String> {
        if token.is_empty() {
            return None;
        }
        self.full_text.push_str(token);
        let delta = &self.full_text[self.last_emitted_len..];
        if delta.is_empty() {
            return None;
        }
        let delta = delta.to_string();
        self.last_emitted_len = self.full_text.len();
        Some(delta)
    }

    pub fn text(&self) -> &str {
        &self.full_text
    }

    pub fn emitted_len(&self) -> usize {
        self.last_emitted_len
    }

    pub fn is_blank(&self) -> bool {
        self.full_text.trim().is_empty()
    }

    pub fn into_text(self) -> String {
        self.full_text
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deltas_sum_to_final_text() {
        let chunks = ["The", " answer", "", " is", " 4", "", "."];
        let mut running = RunningResponse::new();
        let mut deltas = Vec::new();
        for c in chunks {
            if let Some(d) = running.apply(c) {
                deltas.push(d);
            }
        }
        assert!(deltas.iter().all(|d| !d.is_empty()));
        assert_eq!(deltas.concat(), running.text());
        assert_eq!(running.text(), "The answer is 4.");
        assert_eq!(running.emitted_len(), running.text().len());
    }

    #[test]
    fn test_empty_token_emits_nothing() {
        let mut running = RunningResponse::new();
        assert_eq!(running.apply(""), None);
        assert!(running.is_blank());
        assert_eq!(running.apply("héllo"), Some("héllo".to_string()));
        assert_eq!(running.apply(""), None);
        assert_eq!(running.into_text(), "héllo");
    }

    #[test]
    fn test_whitespace_only_response_is_blank() {
        let mut running = RunningResponse::new();
        assert_eq!(running.apply("  \n"), Some("  \n".to_string()));
        assert!(running.is_blank());
    }
}
