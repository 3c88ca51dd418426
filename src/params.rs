//! `key=value` parameter commands sent from the printer console
//!
//! Results are echoed back with `RESPOND` so they show up in the console.

/// Split `set_xxx_params a=1 b=2` into its `key=value` parts, skipping the command word
pub fn split_params(message: &str) -> impl Iterator<Item = &str> {
    message.split_whitespace().skip(1)
}

/// `RESPOND` gcode showing `msg` in the printer console
pub fn respond(prefix: &str, msg: &str) -> String {
    format!(
        "RESPOND PREFIX=\"{}\" MSG=\"{}\"",
        prefix.replace('"', "'"),
        msg.replace('"', "'")
    )
}

/// Collects the outcome of a parameter command
#[derive(Debug)]
pub struct ParamsReport {
    prefix: &'static str,
    changed: Vec<String>,
    errors: Vec<String>,
}

impl ParamsReport {
    pub fn new(prefix: &'static str) -> Self {
        Self {
            prefix,
            changed: Vec::new(),
            errors: Vec::new(),
        }
    }

    pub fn changed(&mut self, key: &str, value: impl std::fmt::Display) {
        self.changed.push(format!("{}={}", key, value));
    }

    pub fn unknown(&mut self, part: &str) {
        self.errors.push(format!("unknown param `{}`", part));
    }

    pub fn failed(&mut self, part: &str, reason: impl std::fmt::Display) {
        self.errors.push(format!("Failed parsing `{}`. {}", part, reason));
    }

    pub fn has_changes(&self) -> bool {
        !self.changed.is_empty()
    }

    /// Console scripts: one per error, then the changes and the full config
    pub fn into_scripts(self, full_config: &str) -> Vec<String> {
        let error_prefix = format!("{} error", self.prefix);
        let mut scripts: Vec<String> = self
            .errors
            .iter()
            .map(|error| respond(&error_prefix, error))
            .collect();

        if !self.changed.is_empty() {
            scripts.push(respond(
                self.prefix,
                &format!("Changed {}: {}", self.prefix.to_lowercase(), self.changed.join(" ")),
            ));
            scripts.push(respond(
                self.prefix,
                &format!("Full {} config: {}", self.prefix.to_lowercase(), full_config),
            ));
        }
        scripts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_skips_command() {
        let parts: Vec<_> = split_params("set_notify_params percent=5  height=2.5").collect();
        assert_eq!(parts, vec!["percent=5", "height=2.5"]);
    }

    #[test]
    fn test_respond_escapes_quotes() {
        assert_eq!(
            respond("Notify", "say \"hi\""),
            "RESPOND PREFIX=\"Notify\" MSG=\"say 'hi'\""
        );
    }

    #[test]
    fn test_report_scripts() {
        let mut report = ParamsReport::new("Notification params");
        report.changed("percent", 5);
        report.unknown("foo=1");

        let scripts = report.into_scripts("percent=5 height=0 time=0");
        assert_eq!(scripts.len(), 3);
        assert!(scripts[0].contains("Notification params error"));
        assert!(scripts[1].contains("Changed notification params: percent=5"));
        assert!(scripts[2].contains("Full notification params config"));
    }

    #[test]
    fn test_report_without_changes_only_errors() {
        let mut report = ParamsReport::new("Timelapse params");
        report.failed("height=abc", "invalid float literal");
        let scripts = report.into_scripts("");
        assert_eq!(scripts.len(), 1);
    }
}
