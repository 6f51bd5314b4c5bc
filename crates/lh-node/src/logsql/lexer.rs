//! Character cursor shared by the filter and pipe parsers.

use super::ParseError;

pub(crate) struct Lexer<'a> {
    src: &'a str,
    pos: usize,
}

impl<'a> Lexer<'a> {
    pub fn new(src: &'a str) -> Self {
        Self { src, pos: 0 }
    }

    pub fn pos(&self) -> usize {
        self.pos
    }

    pub fn reset(&mut self, pos: usize) {
        self.pos = pos;
    }

    pub fn rest(&self) -> &'a str {
        &self.src[self.pos..]
    }

    /// Source text from `start` up to the cursor.
    pub fn slice_from(&self, start: usize) -> &'a str {
        &self.src[start..self.pos]
    }

    pub fn peek(&self) -> Option<char> {
        self.rest().chars().next()
    }

    pub fn bump(&mut self) -> Option<char> {
        let c = self.peek()?;
        self.pos += c.len_utf8();
        Some(c)
    }

    pub fn skip_ws(&mut self) {
        while self.peek().is_some_and(char::is_whitespace) {
            self.bump();
        }
    }

    pub fn at_end(&mut self) -> bool {
        self.skip_ws();
        self.peek().is_none()
    }

    /// Consumes `c` after optional whitespace.
    pub fn eat(&mut self, c: char) -> bool {
        self.skip_ws();
        if self.peek() == Some(c) {
            self.bump();
            true
        } else {
            false
        }
    }

    pub fn expect(&mut self, c: char) -> Result<(), ParseError> {
        if self.eat(c) {
            Ok(())
        } else {
            Err(self.error(format!("expected '{}'", c)))
        }
    }

    /// Whether the next token is the keyword `kw` (case-insensitive) and not
    /// a field name.
    pub fn peek_keyword(&mut self, kw: &str) -> bool {
        self.skip_ws();
        let rest = self.rest();
        let Some(head) = rest.get(..kw.len()) else {
            return false;
        };
        if !head.eq_ignore_ascii_case(kw) {
            return false;
        }
        match rest[kw.len()..].chars().next() {
            None => true,
            Some(c) => c.is_whitespace() || matches!(c, '(' | ')' | '|' | '!' | '"' | '\'' | ','),
        }
    }

    pub fn eat_keyword(&mut self, kw: &str) -> bool {
        if self.peek_keyword(kw) {
            self.pos += kw.len();
            true
        } else {
            false
        }
    }

    /// Reads an unquoted token. Stops at whitespace, brackets, commas, pipes
    /// and quotes, and at `:` when `stop_at_colon` is set.
    pub fn bare(&mut self, stop_at_colon: bool) -> String {
        self.skip_ws();
        let start = self.pos;
        while let Some(c) = self.peek() {
            let stop = c.is_whitespace()
                || matches!(c, '(' | ')' | ',' | '|' | '"' | '\'' | '`' | '{' | '}')
                || (stop_at_colon && c == ':');
            if stop {
                break;
            }
            self.bump();
        }
        self.src[start..self.pos].to_string()
    }

    pub fn peek_quote(&mut self) -> bool {
        self.skip_ws();
        matches!(self.peek(), Some('"' | '\'' | '`'))
    }

    /// Reads a `"..."`, `'...'` or `` `...` `` string. Backquoted strings are
    /// raw; the others understand `\\`, `\"`, `\'`, `\n` and `\t`.
    pub fn quoted(&mut self) -> Result<String, ParseError> {
        self.skip_ws();
        let start = self.pos;
        let quote = match self.bump() {
            Some(q @ ('"' | '\'' | '`')) => q,
            _ => return Err(self.error("expected a quoted string")),
        };
        let mut out = String::new();
        loop {
            match self.bump() {
                None => {
                    self.pos = start;
                    return Err(self.error("unterminated string"));
                }
                Some(c) if c == quote => return Ok(out),
                Some('\\') if quote != '`' => match self.bump() {
                    Some('n') => out.push('\n'),
                    Some('t') => out.push('\t'),
                    Some(c) => out.push(c),
                    None => {
                        self.pos = start;
                        return Err(self.error("unterminated string"));
                    }
                },
                Some(c) => out.push(c),
            }
        }
    }

    /// A quoted string or a bare token.
    pub fn value(&mut self, stop_at_colon: bool) -> Result<String, ParseError> {
        if self.peek_quote() {
            self.quoted()
        } else {
            Ok(self.bare(stop_at_colon))
        }
    }

    pub fn error(&self, message: impl Into<String>) -> ParseError {
        ParseError {
            pos: self.pos,
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bare_and_quoted() {
        let mut lx = Lexer::new(r#"  host:db-1 "a \"b\"" `c\d` 'e'"#);
        assert_eq!(lx.bare(true), "host");
        assert!(lx.eat(':'));
        assert_eq!(lx.bare(false), "db-1");
        assert_eq!(lx.quoted().unwrap(), "a \"b\"");
        assert_eq!(lx.quoted().unwrap(), "c\\d");
        assert_eq!(lx.value(true).unwrap(), "e");
        assert!(lx.at_end());
    }

    #[test]
    fn test_keywords_need_delimiter() {
        let mut lx = Lexer::new("order or");
        assert!(!lx.peek_keyword("or"));
        assert_eq!(lx.bare(true), "order");
        assert!(lx.eat_keyword("OR"));
        assert!(lx.at_end());
    }

    #[test]
    fn test_unterminated_string_reports_start() {
        let mut lx = Lexer::new("  \"abc");
        let err = lx.quoted().unwrap_err();
        assert_eq!(err.pos, 2);
    }
}
