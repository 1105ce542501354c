use serde::{Deserialize, Serialize};

/// Content types steering how text is prefixed before encoding and how
/// retrieval filters the index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContentType {
    Code,
    Text,
    Config,
    Memory,
    Thread,
    General,
}

impl ContentType {
    /// Encoder input prefix. The index stays symmetric with query-side use:
    /// most content embeds as a passage, but code embeds with the query
    /// prefix because queries against code are themselves code-shaped.
    pub fn input_prefix(self) -> &'static str {
        match self {
            ContentType::Code => "query: ",
            _ => "passage: ",
        }
    }
}

impl std::fmt::Display for ContentType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ContentType::Code => "code",
            ContentType::Text => "text",
            ContentType::Config => "config",
            ContentType::Memory => "memory",
            ContentType::Thread => "thread",
            ContentType::General => "general",
        };
        f.write_str(s)
    }
}

const CODE_SIGNALS: &[&str] = &[
    "import ", "def ", "class ", "function ", "const ", "let ", "var ", "=> {", "};", "fn ",
];

/// Heuristic detection for content that arrives without an explicit type.
pub fn detect_content_type(text: &str) -> ContentType {
    if CODE_SIGNALS.iter().any(|s| text.contains(s)) {
        return ContentType::Code;
    }
    let trimmed = text.trim_start();
    if trimmed.starts_with('{') || trimmed.starts_with('[') || trimmed.starts_with("---") {
        return ContentType::Config;
    }
    ContentType::Text
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_code_by_keyword() {
        assert_eq!(
            detect_content_type("def handle(x):\n    return x"),
            ContentType::Code
        );
        assert_eq!(detect_content_type("fn main() {}"), ContentType::Code);
    }

    #[test]
    fn detects_config_by_prefix() {
        assert_eq!(detect_content_type("{\"a\": 1}"), ContentType::Config);
        assert_eq!(detect_content_type("---\ntitle: x"), ContentType::Config);
    }

    #[test]
    fn plain_prose_is_text() {
        assert_eq!(
            detect_content_type("We talked about the garden."),
            ContentType::Text
        );
    }

    #[test]
    fn code_uses_query_prefix() {
        assert_eq!(ContentType::Code.input_prefix(), "query: ");
        assert_eq!(ContentType::Memory.input_prefix(), "passage: ");
    }
}
