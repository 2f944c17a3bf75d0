//! LLaVA conversation templates.
//!
//! A template is a system prompt, two role names and a separator scheme. The
//! rendered string is fed to the tokenizer as is, so every space and newline
//! here is part of the model's expected input.

use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeparatorStyle {
    /// `system###Role: msg###Role:` with one separator everywhere.
    Single,
    /// Alternating separators: `sep` after user turns, `sep2` after the
    /// assistant's.
    Two,
    /// `[INST] <<SYS>>..<</SYS>> msg [/INST] reply </s><s>[INST] ...`.
    Llama2,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Conversation {
    pub system: String,
    pub roles: [String; 2],
    /// `(role, message)`; `None` marks the turn the model is to fill.
    pub messages: Vec<(String, Option<String>)>,
    pub style: SeparatorStyle,
    pub sep: String,
    pub sep2: Option<String>,
    pub version: String,
}

impl Conversation {
    pub fn user_role(&self) -> &str {
        &self.roles[0]
    }

    pub fn assistant_role(&self) -> &str {
        &self.roles[1]
    }

    pub fn append_message(&mut self, role: &str, message: Option<&str>) {
        self.messages
            .push((role.to_string(), message.map(str::to_string)));
    }

    pub fn get_prompt(&self) -> String {
        match self.style {
            SeparatorStyle::Single => self.render_single(),
            SeparatorStyle::Two => self.render_two(),
            SeparatorStyle::Llama2 => self.render_llama2(),
        }
    }

    fn render_single(&self) -> String {
        let mut ret = format!("{}{}", self.system, self.sep);
        for (role, message) in &self.messages {
            match message {
                Some(msg) => ret.push_str(&format!("{role}: {msg}{}", self.sep)),
                None => ret.push_str(&format!("{role}:")),
            }
        }
        ret
    }

    fn render_two(&self) -> String {
        let seps = [self.sep.as_str(), self.sep2.as_deref().unwrap_or_default()];
        let mut ret = format!("{}{}", self.system, seps[0]);
        for (i, (role, message)) in self.messages.iter().enumerate() {
            match message {
                Some(msg) => ret.push_str(&format!("{role}: {msg}{}", seps[i % 2])),
                None => ret.push_str(&format!("{role}:")),
            }
        }
        ret
    }

    fn render_llama2(&self) -> String {
        let sep2 = self.sep2.as_deref().unwrap_or_default();
        let mut ret = String::new();
        for (i, (_, message)) in self.messages.iter().enumerate() {
            let Some(msg) = message else {
                continue;
            };
            let msg = if i == 0 && !self.system.is_empty() {
                format!("<<SYS>>\n{}\n<</SYS>>\n\n{msg}", self.system)
            } else {
                msg.clone()
            };
            if i % 2 == 0 {
                ret.push_str(&format!("{}[INST] {msg} [/INST]", self.sep));
            } else {
                ret.push_str(&format!(" {msg} {sep2}"));
            }
        }
        // leading separator characters are stripped, not the separator string
        ret.trim_start_matches(|c| self.sep.contains(c)).to_string()
    }
}

const LLAVA_SYSTEM: &str = "A chat between a curious human and an artificial intelligence assistant. \
The assistant gives helpful, detailed, and polite answers to the human's questions.";

const LLAVA_LLAMA_2_SYSTEM: &str = "You are a helpful language and vision assistant. \
You are able to understand the visual content that the user provides, \
and assist the user with a variety of tasks using natural language.";

fn template(
    system: &str,
    roles: [&str; 2],
    style: SeparatorStyle,
    sep: &str,
    sep2: Option<&str>,
    version: &str,
) -> Conversation {
    Conversation {
        system: system.to_string(),
        roles: roles.map(str::to_string),
        messages: Vec::new(),
        style,
        sep: sep.to_string(),
        sep2: sep2.map(str::to_string),
        version: version.to_string(),
    }
}

/// Named templates. Lookups hand out fresh copies.
pub struct ConversationTemplates {
    templates: HashMap<&'static str, Conversation>,
}

impl ConversationTemplates {
    pub fn builtin() -> Self {
        let mut templates = HashMap::new();
        templates.insert(
            "llava_v0",
            template(
                LLAVA_SYSTEM,
                ["Human", "Assistant"],
                SeparatorStyle::Single,
                "###",
                None,
                "v0",
            ),
        );
        templates.insert(
            "llava_v1",
            template(
                LLAVA_SYSTEM,
                ["USER", "ASSISTANT"],
                SeparatorStyle::Two,
                " ",
                Some("</s>"),
                "v1",
            ),
        );
        templates.insert(
            "llava_llama_2",
            template(
                LLAVA_LLAMA_2_SYSTEM,
                ["USER", "ASSISTANT"],
                SeparatorStyle::Llama2,
                "<s>",
                Some("</s>"),
                "llama_v2",
            ),
        );
        Self { templates }
    }

    pub fn get(&self, name: &str) -> Option<Conversation> {
        self.templates.get(name).cloned()
    }

    pub fn names(&self) -> Vec<&'static str> {
        let mut names: Vec<_> = self.templates.keys().copied().collect();
        names.sort_unstable();
        names
    }
}

impl Default for ConversationTemplates {
    fn default() -> Self {
        Self::builtin()
    }
}

/// Template for a model name, case-insensitive: `llama-2` beats `v1`, and
/// anything else gets `llava_v0`.
pub fn select_conv_mode(model_name: &str) -> &'static str {
    let name = model_name.to_lowercase();
    if name.contains("llama-2") {
        "llava_llama_2"
    } else if name.contains("v1") {
        "llava_v1"
    } else {
        "llava_v0"
    }
}

/// Last path component, or `<parent>_<checkpoint-N>` for training checkpoints.
pub fn model_name_from_path(model_path: &str) -> String {
    let parts: Vec<&str> = model_path.trim_matches('/').split('/').collect();
    match parts.as_slice() {
        [.., parent, last] if last.starts_with("checkpoint-") => format!("{parent}_{last}"),
        [.., last] => last.to_string(),
        [] => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn render(mode: &str, user: &str) -> String {
        let mut conv = ConversationTemplates::builtin().get(mode).unwrap();
        let (user_role, assistant_role) =
            (conv.user_role().to_string(), conv.assistant_role().to_string());
        conv.append_message(&user_role, Some(user));
        conv.append_message(&assistant_role, None);
        conv.get_prompt()
    }

    #[test]
    fn llava_v0_rendering() {
        assert_eq!(
            render("llava_v0", "hi"),
            format!("{LLAVA_SYSTEM}###Human: hi###Assistant:")
        );
    }

    #[test]
    fn llava_v1_rendering() {
        assert_eq!(
            render("llava_v1", "<image>\nhi"),
            format!("{LLAVA_SYSTEM} USER: <image>\nhi ASSISTANT:")
        );
    }

    #[test]
    fn llava_v1_multi_turn_uses_both_separators() {
        let mut conv = ConversationTemplates::builtin().get("llava_v1").unwrap();
        conv.append_message("USER", Some("a"));
        conv.append_message("ASSISTANT", Some("b"));
        conv.append_message("USER", Some("c"));
        conv.append_message("ASSISTANT", None);
        assert_eq!(
            conv.get_prompt(),
            format!("{LLAVA_SYSTEM} USER: a ASSISTANT: b</s>USER: c ASSISTANT:")
        );
    }

    #[test]
    fn llava_llama_2_rendering() {
        assert_eq!(
            render("llava_llama_2", "hi"),
            format!("[INST] <<SYS>>\n{LLAVA_LLAMA_2_SYSTEM}\n<</SYS>>\n\nhi [/INST]")
        );
    }

    #[test]
    fn llama_2_multi_turn() {
        let mut conv = ConversationTemplates::builtin().get("llava_llama_2").unwrap();
        conv.system.clear();
        conv.append_message("USER", Some("a"));
        conv.append_message("ASSISTANT", Some("b"));
        conv.append_message("USER", Some("c"));
        assert_eq!(conv.get_prompt(), "[INST] a [/INST] b </s><s>[INST] c [/INST]");
    }

    #[test]
    fn lookups_are_independent_copies() {
        let templates = ConversationTemplates::builtin();
        let mut a = templates.get("llava_v1").unwrap();
        a.append_message("USER", Some("x"));
        assert!(templates.get("llava_v1").unwrap().messages.is_empty());
        assert_eq!(templates.names(), vec!["llava_llama_2", "llava_v0", "llava_v1"]);
        assert!(templates.get("chatml").is_none());
    }

    #[test]
    fn conv_mode_priority() {
        assert_eq!(select_conv_mode("llava-llama-2-13b-chat-v1"), "llava_llama_2");
        assert_eq!(select_conv_mode("LLaVA-Llama-2-7B"), "llava_llama_2");
        assert_eq!(select_conv_mode("llava-v1.5-7b"), "llava_v1");
        assert_eq!(select_conv_mode("LLAVA-V1.6"), "llava_v1");
        assert_eq!(select_conv_mode("llava-7b"), "llava_v0");
    }

    #[test]
    fn model_names() {
        assert_eq!(model_name_from_path("liuhaotian/llava-v1.5-7b"), "llava-v1.5-7b");
        assert_eq!(model_name_from_path("/ckpt/llava-v1.5-7b/"), "llava-v1.5-7b");
        assert_eq!(
            model_name_from_path("runs/llava-lora/checkpoint-500"),
            "llava-lora_checkpoint-500"
        );
        assert_eq!(model_name_from_path("checkpoint-7"), "checkpoint-7");
    }
}
