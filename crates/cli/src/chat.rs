//! Chat prompt templating and end-of-sequence detection.

use crate::args::ChatTemplateKind;

pub struct ChatItem {
    pub role: String,
    pub content: String,
}

impl ChatItem {
    pub fn new(role: &str, content: &str) -> Self {
        ChatItem {
            role: role.to_string(),
            content: content.to_string(),
        }
    }
}

pub struct ChatTemplate {
    kind: ChatTemplateKind,
}

impl ChatTemplate {
    pub fn new(kind: ChatTemplateKind) -> Self {
        ChatTemplate { kind }
    }

    /// Renders a delta of chat items into prompt text; with
    /// `add_generation_prompt` the assistant header is appended so the
    /// model continues as the assistant.
    pub fn format(&self, items: &[ChatItem], add_generation_prompt: bool) -> String {
        let mut out = String::new();
        match self.kind {
            ChatTemplateKind::Llama2 => {
                let mut system = None;
                for item in items {
                    match item.role.as_str() {
                        "system" => system = Some(item.content.as_str()),
                        "user" => {
                            out.push_str("[INST] ");
                            if let Some(system) = system.take() {
                                out.push_str("<<SYS>>\n");
                                out.push_str(system);
                                out.push_str("\n<</SYS>>\n\n");
                            }
                            out.push_str(&item.content);
                            out.push_str(" [/INST]");
                        }
                        _ => {
                            out.push(' ');
                            out.push_str(&item.content);
                            out.push_str(" </s>");
                        }
                    }
                }
            }
            ChatTemplateKind::Llama3 => {
                for item in items {
                    out.push_str("<|start_header_id|>");
                    out.push_str(&item.role);
                    out.push_str("<|end_header_id|>\n\n");
                    out.push_str(&item.content);
                    out.push_str("<|eot_id|>");
                }
                if add_generation_prompt {
                    out.push_str("<|start_header_id|>assistant<|end_header_id|>\n\n");
                }
            }
            ChatTemplateKind::DeepSeek3 => {
                for item in items {
                    match item.role.as_str() {
                        "system" => out.push_str(&item.content),
                        "user" => {
                            out.push_str("<｜User｜>");
                            out.push_str(&item.content);
                        }
                        _ => {
                            out.push_str("<｜Assistant｜>");
                            out.push_str(&item.content);
                        }
                    }
                }
                if add_generation_prompt {
                    out.push_str("<｜Assistant｜>");
                }
            }
        }
        out
    }

    /// The textual stop marker of this template.
    pub fn stop_string(&self) -> &'static str {
        match self.kind {
            ChatTemplateKind::Llama2 => "</s>",
            ChatTemplateKind::Llama3 => "<|eot_id|>",
            ChatTemplateKind::DeepSeek3 => "<｜end▁of▁sentence｜>",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EosKind {
    /// The stop marker completed; stop generating.
    Eos,
    /// Definitely not a stop marker; the buffered text can be flushed.
    NotEos,
    /// A prefix of the stop marker; hold the buffer.
    Maybe,
}

/// Watches the decoded stream for EOS token ids and the template's
/// textual stop marker, holding back text that could be a partial
/// marker.
pub struct EosDetector {
    eos_token_ids: Vec<u32>,
    stop: String,
    buffer: String,
}

impl EosDetector {
    pub fn new(eos_token_ids: Vec<u32>, stop: &str) -> Self {
        EosDetector {
            eos_token_ids,
            stop: stop.to_string(),
            buffer: String::new(),
        }
    }

    pub fn append(&mut self, token: u32, piece: &str) -> EosKind {
        if self.eos_token_ids.contains(&token) {
            return EosKind::Eos;
        }
        self.buffer.push_str(piece);
        if self.buffer.contains(&self.stop) {
            return EosKind::Eos;
        }
        // A suffix of the buffer that prefixes the stop marker may
        // still grow into it.
        let held = (1..=self.stop.len().min(self.buffer.len()))
            .rev()
            .find(|&n| {
                self.buffer.is_char_boundary(self.buffer.len() - n)
                    && self.stop.starts_with(&self.buffer[self.buffer.len() - n..])
            });
        match held {
            Some(_) => EosKind::Maybe,
            None => EosKind::NotEos,
        }
    }

    /// Returns and clears the text that is safe to print.
    pub fn take_delta(&mut self) -> Option<String> {
        if self.buffer.is_empty() {
            return None;
        }
        let held = (1..=self.stop.len().min(self.buffer.len()))
            .rev()
            .find(|&n| {
                self.buffer.is_char_boundary(self.buffer.len() - n)
                    && self.stop.starts_with(&self.buffer[self.buffer.len() - n..])
            })
            .unwrap_or(0);
        let safe = self.buffer.len() - held;
        if safe == 0 {
            return None;
        }
        let out = self.buffer[..safe].to_string();
        self.buffer.drain(..safe);
        Some(out)
    }

    pub fn reset(&mut self) {
        self.buffer.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_llama2_template() {
        let template = ChatTemplate::new(ChatTemplateKind::Llama2);
        let text = template.format(
            &[
                ChatItem::new("system", "be brief"),
                ChatItem::new("user", "hi"),
            ],
            true,
        );
        assert!(text.starts_with("[INST] <<SYS>>\nbe brief\n<</SYS>>\n\nhi [/INST]"));
    }

    #[test]
    fn test_llama3_generation_prompt() {
        let template = ChatTemplate::new(ChatTemplateKind::Llama3);
        let text = template.format(&[ChatItem::new("user", "hi")], true);
        assert!(text.ends_with("<|start_header_id|>assistant<|end_header_id|>\n\n"));
    }

    #[test]
    fn test_eos_detector_token_id() {
        let mut detector = EosDetector::new(vec![2], "</s>");
        assert_eq!(detector.append(2, ""), EosKind::Eos);
    }

    #[test]
    fn test_eos_detector_partial_marker() {
        let mut detector = EosDetector::new(vec![], "</s>");
        assert_eq!(detector.append(10, "hello"), EosKind::NotEos);
        assert_eq!(detector.take_delta().as_deref(), Some("hello"));
        assert_eq!(detector.append(11, "</"), EosKind::Maybe);
        assert_eq!(detector.take_delta(), None);
        assert_eq!(detector.append(12, "s>"), EosKind::Eos);
    }
}
