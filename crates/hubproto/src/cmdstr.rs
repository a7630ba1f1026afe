//! Command string formatting.
//!
//! Actors take commands of the form `verb [name=value ...]`. Multi-valued
//! arguments are comma-joined inside one `name=` token:
//!
//! ```
//! use hubproto::CmdString;
//!
//! let cmd = CmdString::new("centroid")
//!     .args("on", [512.0, 512.0])
//!     .arg("cradius", 5.0)
//!     .build();
//! assert_eq!(cmd, "centroid on=512.0,512.0 cradius=5.0");
//! ```

use std::borrow::Cow;

/// Something that can be written as a command argument value.
pub trait ArgValue {
    fn render(&self) -> String;
}

impl ArgValue for f64 {
    fn render(&self) -> String {
        // Debug always keeps a decimal point: 512.0 rather than 512
        format!("{:?}", self)
    }
}

impl ArgValue for f32 {
    fn render(&self) -> String {
        format!("{:?}", self)
    }
}

macro_rules! int_arg_value {
    ($($t:ty),*) => {
        $(impl ArgValue for $t {
            fn render(&self) -> String {
                self.to_string()
            }
        })*
    };
}

int_arg_value!(i32, i64, u32, u64, usize);

impl ArgValue for &str {
    fn render(&self) -> String {
        quote_if_needed(self).into_owned()
    }
}

impl ArgValue for String {
    fn render(&self) -> String {
        quote_if_needed(self).into_owned()
    }
}

/// Builder for `verb name=value ...` command strings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CmdString {
    verb: String,
    parts: Vec<String>,
}

impl CmdString {
    pub fn new(verb: impl Into<String>) -> Self {
        Self {
            verb: verb.into(),
            parts: Vec::new(),
        }
    }

    pub fn arg(mut self, name: &str, value: impl ArgValue) -> Self {
        self.parts.push(format!("{}={}", name, value.render()));
        self
    }

    pub fn args<V, I>(mut self, name: &str, values: I) -> Self
    where
        V: ArgValue,
        I: IntoIterator<Item = V>,
    {
        let joined: Vec<String> = values.into_iter().map(|v| v.render()).collect();
        self.parts.push(format!("{}={}", name, joined.join(",")));
        self
    }

    /// Bare word such as `/full` or a sub-verb (`set filter ...`).
    pub fn flag(mut self, name: &str) -> Self {
        self.parts.push(name.to_string());
        self
    }

    /// Pre-formatted text appended verbatim.
    pub fn raw(mut self, text: &str) -> Self {
        if !text.trim().is_empty() {
            self.parts.push(text.trim().to_string());
        }
        self
    }

    pub fn build(&self) -> String {
        self.to_string()
    }
}

impl std::fmt::Display for CmdString {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.verb)?;
        for part in &self.parts {
            write!(f, " {}", part)?;
        }
        Ok(())
    }
}

/// Quote a string value when it would otherwise be split or misread.
pub fn quote_if_needed(s: &str) -> Cow<'_, str> {
    let needs_quotes = s.is_empty()
        || s == "?"
        || s.eq_ignore_ascii_case("nan")
        || s
            .chars()
            .any(|c| c.is_whitespace() || matches!(c, ',' | ';' | '=' | '"' | '\'' | '\\'));

    if !needs_quotes {
        return Cow::Borrowed(s);
    }

    let mut out = String::with_capacity(s.len() + 2);
    out.push('"');
    for c in s.chars() {
        if c == '"' || c == '\\' {
            out.push('\\');
        }
        out.push(c);
    }
    out.push('"');
    Cow::Owned(out)
}

/// Format the line written to the hub for one command.
pub fn format_command_line(cmd_id: u32, actor: &str, cmd_str: &str) -> String {
    format!("{} {} {}\n", cmd_id, actor, cmd_str.trim())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verb_with_sub_verb_and_int() {
        let cmd = CmdString::new("set").flag("filter").arg("move", 3).build();
        assert_eq!(cmd, "set filter move=3");
    }

    #[test]
    fn floats_keep_decimal_point() {
        let cmd = CmdString::new("offset").arg("arc", 0.0).arg("rot", -1.5).build();
        assert_eq!(cmd, "offset arc=0.0 rot=-1.5");
    }

    #[test]
    fn strings_are_quoted_when_needed() {
        let cmd = CmdString::new("expose")
            .arg("name", "test")
            .arg("comment", "seeing good, clear")
            .build();
        assert_eq!(cmd, r#"expose name=test comment="seeing good, clear""#);
    }

    #[test]
    fn quote_escapes_embedded_quotes() {
        assert_eq!(quote_if_needed(r#"SDSS "u""#), r#""SDSS \"u\"""#);
        assert_eq!(quote_if_needed(""), "\"\"");
        assert_eq!(quote_if_needed("plain"), "plain");
    }

    #[test]
    fn raw_text_is_trimmed() {
        let cmd = CmdString::new("guide").raw("  off ").build();
        assert_eq!(cmd, "guide off");
        assert_eq!(CmdString::new("version").raw("").build(), "version");
    }

    #[test]
    fn command_line_layout() {
        assert_eq!(format_command_line(7, "hub", "version "), "7 hub version\n");
    }
}
