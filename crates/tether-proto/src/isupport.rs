//! ISUPPORT (numeric 005) token ingestion.
//!
//! The bouncer tracks the handful of tokens it consults: CASEMAPPING
//! drives every name comparison, CHANTYPES decides what counts as a
//! channel, PREFIX maps membership modes to NAMES symbols, NETWORK is
//! surfaced to downstreams. Unknown tokens are retained verbatim so they
//! can be replayed to clients.

use std::collections::HashMap;

use crate::casemap::CaseMapping;

/// Parsed server capabilities from one or more 005 replies.
#[derive(Debug, Clone)]
pub struct Isupport {
    /// The active case-folding rule.
    pub casemapping: CaseMapping,
    /// Characters that begin a channel name.
    pub chantypes: String,
    /// Membership (mode, prefix symbol) pairs, highest rank first.
    pub prefix: Vec<(char, char)>,
    /// The advertised network name, if any.
    pub network: Option<String>,
    /// All tokens seen, last value wins. Negated tokens are removed.
    pub raw: HashMap<String, Option<String>>,
}

impl Default for Isupport {
    fn default() -> Self {
        Isupport {
            casemapping: CaseMapping::default(),
            chantypes: "#&".to_string(),
            prefix: vec![('o', '@'), ('v', '+')],
            network: None,
            raw: HashMap::new(),
        }
    }
}

impl Isupport {
    /// Ingest the parameters of one 005 reply, excluding the leading
    /// client nick and the trailing "are supported" text.
    pub fn ingest<S: AsRef<str>>(&mut self, tokens: &[S]) {
        for token in tokens {
            let token = token.as_ref();
            if let Some(negated) = token.strip_prefix('-') {
                self.raw.remove(negated);
                continue;
            }
            let (key, value) = match token.split_once('=') {
                Some((key, value)) => (key, Some(value.to_string())),
                None => (token, None),
            };

            match key {
                "CASEMAPPING" => {
                    if let Some(m) = value.as_deref().and_then(CaseMapping::from_isupport) {
                        self.casemapping = m;
                    }
                }
                "CHANTYPES" => {
                    if let Some(v) = &value {
                        self.chantypes = v.clone();
                    }
                }
                "PREFIX" => {
                    if let Some(v) = &value {
                        if let Some(parsed) = parse_prefix(v) {
                            self.prefix = parsed;
                        }
                    }
                }
                "NETWORK" => self.network = value.clone(),
                _ => {}
            }
            self.raw.insert(key.to_string(), value);
        }
    }

    /// Whether a target names a channel under the advertised CHANTYPES.
    pub fn is_channel(&self, target: &str) -> bool {
        target
            .chars()
            .next()
            .is_some_and(|c| self.chantypes.contains(c))
    }

    /// The NAMES symbol for a membership mode, if the server advertises
    /// one.
    pub fn prefix_symbol(&self, mode: char) -> Option<char> {
        self.prefix
            .iter()
            .find(|(m, _)| *m == mode)
            .map(|(_, sym)| *sym)
    }

    /// Whether a character is one of the advertised membership symbols.
    pub fn is_prefix_symbol(&self, sym: char) -> bool {
        self.prefix.iter().any(|(_, s)| *s == sym)
    }
}

/// Parse `PREFIX=(modes)symbols` into (mode, symbol) pairs.
fn parse_prefix(value: &str) -> Option<Vec<(char, char)>> {
    let rest = value.strip_prefix('(')?;
    let (modes, symbols) = rest.split_once(')')?;
    if modes.chars().count() != symbols.chars().count() {
        return None;
    }
    Some(modes.chars().zip(symbols.chars()).collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ingest_common_tokens() {
        let mut isupport = Isupport::default();
        isupport.ingest(&[
            "CASEMAPPING=ascii",
            "CHANTYPES=#",
            "PREFIX=(qov)~@+",
            "NETWORK=TestNet",
            "EXCEPTS",
        ]);
        assert_eq!(isupport.casemapping, CaseMapping::Ascii);
        assert_eq!(isupport.chantypes, "#");
        assert_eq!(isupport.prefix, vec![('q', '~'), ('o', '@'), ('v', '+')]);
        assert_eq!(isupport.network.as_deref(), Some("TestNet"));
        assert!(isupport.raw.contains_key("EXCEPTS"));
    }

    #[test]
    fn negation_removes_token() {
        let mut isupport = Isupport::default();
        isupport.ingest(&["EXCEPTS"]);
        isupport.ingest(&["-EXCEPTS"]);
        assert!(!isupport.raw.contains_key("EXCEPTS"));
    }

    #[test]
    fn channel_detection_follows_chantypes() {
        let mut isupport = Isupport::default();
        assert!(isupport.is_channel("#a"));
        assert!(isupport.is_channel("&a"));
        assert!(!isupport.is_channel("nick"));
        isupport.ingest(&["CHANTYPES=#"]);
        assert!(!isupport.is_channel("&a"));
    }

    #[test]
    fn malformed_prefix_keeps_default() {
        let mut isupport = Isupport::default();
        isupport.ingest(&["PREFIX=(ov"]);
        assert_eq!(isupport.prefix, vec![('o', '@'), ('v', '+')]);
    }

    #[test]
    fn prefix_symbol_lookup() {
        let isupport = Isupport::default();
        assert_eq!(isupport.prefix_symbol('o'), Some('@'));
        assert_eq!(isupport.prefix_symbol('x'), None);
        assert!(isupport.is_prefix_symbol('+'));
    }
}
