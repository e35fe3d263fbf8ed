//! Chat text components: the JSON form the protocol transmits, plus the
//! legacy `§`-coded rendering needed for pre-1.11 action bars and log
//! output.

use serde::{Deserialize, Serialize};

/// A chat component tree. Only the subset the proxy itself emits is
/// modelled; components received from backends pass through as opaque JSON.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Component {
    pub text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub color: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bold: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub italic: Option<bool>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub extra: Vec<Component>,
}

impl Component {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Default::default()
        }
    }

    pub fn colored(text: impl Into<String>, color: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            color: Some(color.into()),
            ..Default::default()
        }
    }

    /// Serialises to the wire JSON form.
    pub fn json(&self) -> String {
        serde_json::to_string(self).expect("component serialization cannot fail")
    }

    /// Renders to legacy `§`-coded text.
    pub fn legacy(&self) -> String {
        let mut out = String::new();
        self.render_legacy(&mut out);
        out
    }

    fn render_legacy(&self, out: &mut String) {
        if let Some(code) = self.color.as_deref().and_then(legacy_color_code) {
            out.push('§');
            out.push(code);
        }
        if self.bold == Some(true) {
            out.push_str("§l");
        }
        if self.italic == Some(true) {
            out.push_str("§o");
        }
        out.push_str(&self.text);
        for child in &self.extra {
            child.render_legacy(out);
        }
    }

    /// Renders to plain text, for logging.
    pub fn plain(&self) -> String {
        let mut out = self.text.clone();
        for child in &self.extra {
            out.push_str(&child.plain());
        }
        out
    }
}

fn legacy_color_code(color: &str) -> Option<char> {
    Some(match color {
        "black" => '0',
        "dark_blue" => '1',
        "dark_green" => '2',
        "dark_aqua" => '3',
        "dark_red" => '4',
        "dark_purple" => '5',
        "gold" => '6',
        "gray" => '7',
        "dark_gray" => '8',
        "blue" => '9',
        "green" => 'a',
        "aqua" => 'b',
        "red" => 'c',
        "light_purple" => 'd',
        "yellow" => 'e',
        "white" => 'f',
        _ => return None,
    })
}
