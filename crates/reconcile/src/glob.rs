use regex::Regex;

/// Namespace glob supporting `*` and `?`, matched case-insensitively.
#[derive(Debug, Clone)]
pub struct Glob {
    re: Regex,
    literal: usize,
    exact: bool,
}

impl Glob {
    pub fn new(pattern: &str) -> Result<Self, regex::Error> {
        let mut src = String::with_capacity(pattern.len() + 8);
        src.push_str("(?i)^");
        let mut literal = 0;
        for ch in pattern.chars() {
            match ch {
                '*' => src.push_str(".*"),
                '?' => src.push('.'),
                c => {
                    literal += 1;
                    src.push_str(&regex::escape(c.encode_utf8(&mut [0u8; 4])));
                }
            }
        }
        src.push('$');
        Ok(Self { re: Regex::new(&src)?, literal, exact: literal == pattern.chars().count() })
    }

    pub fn is_match(&self, s: &str) -> bool {
        self.re.is_match(s)
    }

    /// Count of non-wildcard characters.
    pub fn literal_len(&self) -> usize {
        self.literal
    }

    pub fn is_exact(&self) -> bool {
        self.exact
    }
}
