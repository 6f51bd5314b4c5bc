//! # Query parser
//!
//! Recursive descent over [`Lexer`]:
//!
//! ```text
//! query   := or ( '|' pipe )*
//! or      := and ( 'or' and )*
//! and     := unary ( ['and'] unary )*
//! unary   := ('not' | '!') unary | '(' or ')' | term
//! term    := "phrase" | word | prefix* | field ':' value
//! ```

use lh_core::{MSG_FIELD, STREAM_FIELD, TIME_FIELD};

use super::facets::FacetsPipe;
use super::filter::{CompareOp, Filter, Pattern, StreamMatcher, StreamOp};
use super::lexer::Lexer;
use super::pipes::{Pipe, SortKey, SortPipe};
use super::stats::{ByField, StatsFunc, StatsKind, StatsPipe};
use super::time::{parse_duration, parse_time};
use super::{ParseError, Query};

const DEFAULT_LIMIT: u64 = 10;

/// Parse a query string into a [`Query`].
pub fn parse(input: &str, now: i64) -> Result<Query, ParseError> {
    let mut p = Parser {
        lx: Lexer::new(input),
        now,
    };
    let filter = if p.lx.at_end() || p.lx.peek() == Some('|') {
        Filter::All
    } else {
        p.or(MSG_FIELD)?
    };
    let mut pipes = Vec::new();
    while p.lx.eat('|') {
        pipes.push(p.pipe()?);
    }
    if !p.lx.at_end() {
        return Err(p.lx.error(format!("unexpected {:?}", p.lx.rest())));
    }
    Ok(Query { filter, pipes })
}

struct Parser<'a> {
    lx: Lexer<'a>,
    now: i64,
}

impl Parser<'_> {
    // =========================================================================
    // Filters
    // =========================================================================

    fn or(&mut self, field: &str) -> Result<Filter, ParseError> {
        let mut filters = vec![self.and(field)?];
        while self.lx.eat_keyword("or") {
            filters.push(self.and(field)?);
        }
        Ok(if filters.len() == 1 {
            filters.remove(0)
        } else {
            Filter::Or { filters }
        })
    }

    fn and(&mut self, field: &str) -> Result<Filter, ParseError> {
        let mut filters = vec![self.unary(field)?];
        loop {
            if self.lx.at_end() || matches!(self.lx.peek(), Some(')' | '|')) || self.lx.peek_keyword("or") {
                break;
            }
            self.lx.eat_keyword("and");
            filters.push(self.unary(field)?);
        }
        Ok(if filters.len() == 1 {
            filters.remove(0)
        } else {
            Filter::And { filters }
        })
    }

    fn unary(&mut self, field: &str) -> Result<Filter, ParseError> {
        if self.lx.eat_keyword("not") || self.lx.eat('!') {
            let inner = self.unary(field)?;
            return Ok(Filter::Not {
                filter: Box::new(inner),
            });
        }
        if self.lx.eat('(') {
            let inner = self.or(field)?;
            self.lx.expect(')')?;
            return Ok(inner);
        }
        self.term(field)
    }

    fn term(&mut self, field: &str) -> Result<Filter, ParseError> {
        if self.lx.peek_quote() {
            let phrase = self.lx.quoted()?;
            return Ok(Filter::Phrase {
                field: field.to_string(),
                phrase,
            });
        }
        let start = self.lx.pos();
        let token = self.lx.bare(true);
        if token.is_empty() {
            return Err(self.lx.error("expected a filter"));
        }
        if self.lx.peek() == Some(':') {
            self.lx.bump();
            return self.field_value(&token);
        }
        if token == "*" {
            return Ok(Filter::All);
        }
        self.lx.reset(start);
        let token = self.lx.bare(false);
        Ok(word_filter(field, token))
    }

    fn field_value(&mut self, field: &str) -> Result<Filter, ParseError> {
        match self.lx.peek() {
            Some('(') => {
                self.lx.bump();
                let inner = self.or(field)?;
                self.lx.expect(')')?;
                Ok(inner)
            }
            Some('=') => {
                self.lx.bump();
                Ok(Filter::Exact {
                    field: field.to_string(),
                    value: self.lx.value(false)?,
                })
            }
            Some('~') => {
                self.lx.bump();
                let pos = self.lx.pos();
                let source = self.lx.value(false)?;
                let regex = Pattern::new(&source).map_err(|e| ParseError {
                    pos,
                    message: format!("invalid regex {:?}: {}", source, e),
                })?;
                Ok(Filter::Regex {
                    field: field.to_string(),
                    regex,
                })
            }
            Some('>' | '<') => self.comparison(field),
            Some('{') if field == STREAM_FIELD => self.stream_matchers(),
            Some(c) if c.is_whitespace() => Err(self.lx.error(format!("missing value after {}:", field))),
            None => Err(self.lx.error(format!("missing value after {}:", field))),
            _ => {
                if self.lx.peek_quote() {
                    let phrase = self.lx.quoted()?;
                    return Ok(Filter::Phrase {
                        field: field.to_string(),
                        phrase,
                    });
                }
                let pos = self.lx.pos();
                let token = self.lx.bare(false);
                if token.eq_ignore_ascii_case("in") && self.lx.peek() == Some('(') {
                    return self.in_list(field);
                }
                if field == TIME_FIELD {
                    let d = parse_duration(&token).filter(|d| *d > 0).ok_or(ParseError {
                        pos,
                        message: format!("cannot parse duration {:?}", token),
                    })?;
                    return Ok(Filter::Time {
                        min: self.now.saturating_sub(d),
                        max: self.now,
                    });
                }
                Ok(word_filter(field, token))
            }
        }
    }

    fn comparison(&mut self, field: &str) -> Result<Filter, ParseError> {
        let op = match (self.lx.bump(), self.lx.peek()) {
            (Some('>'), Some('=')) => {
                self.lx.bump();
                CompareOp::Gte
            }
            (Some('<'), Some('=')) => {
                self.lx.bump();
                CompareOp::Lte
            }
            (Some('>'), _) => CompareOp::Gt,
            _ => CompareOp::Lt,
        };
        let pos = self.lx.pos();
        let text = self.lx.value(false)?;
        if field == TIME_FIELD {
            let t = parse_time(&text, self.now).ok_or(ParseError {
                pos,
                message: format!("cannot parse time {:?}", text),
            })?;
            let (min, max) = match op {
                CompareOp::Gt => (t.saturating_add(1), i64::MAX),
                CompareOp::Gte => (t, i64::MAX),
                CompareOp::Lt => (i64::MIN, t.saturating_sub(1)),
                CompareOp::Lte => (i64::MIN, t),
            };
            return Ok(Filter::Time { min, max });
        }
        let value: f64 = text.parse().map_err(|_| ParseError {
            pos,
            message: format!("cannot parse number {:?}", text),
        })?;
        Ok(Filter::Range {
            field: field.to_string(),
            op,
            value,
        })
    }

    fn in_list(&mut self, field: &str) -> Result<Filter, ParseError> {
        self.lx.expect('(')?;
        let mut values = Vec::new();
        if !self.lx.eat(')') {
            loop {
                values.push(self.lx.value(false)?);
                if self.lx.eat(')') {
                    break;
                }
                self.lx.expect(',')?;
            }
        }
        Ok(Filter::In {
            field: field.to_string(),
            values,
        })
    }

    fn stream_matchers(&mut self) -> Result<Filter, ParseError> {
        self.lx.expect('{')?;
        let mut matchers = Vec::new();
        if !self.lx.eat('}') {
            loop {
                self.lx.skip_ws();
                let name = self.ident();
                if name.is_empty() {
                    return Err(self.lx.error("expected a stream label name"));
                }
                self.lx.skip_ws();
                let op = if self.lx.rest().starts_with("!=") {
                    "!="
                } else if self.lx.rest().starts_with("=~") {
                    "=~"
                } else if self.lx.rest().starts_with("!~") {
                    "!~"
                } else if self.lx.rest().starts_with('=') {
                    "="
                } else {
                    return Err(self.lx.error("expected =, !=, =~ or !~"));
                };
                for _ in 0..op.len() {
                    self.lx.bump();
                }
                let pos = self.lx.pos();
                let value = self.lx.value(false)?;
                let regex = |v: &str| {
                    Pattern::anchored(v).map_err(|e| ParseError {
                        pos,
                        message: format!("invalid regex {:?}: {}", v, e),
                    })
                };
                let op = match op {
                    "=" => StreamOp::Eq(value),
                    "!=" => StreamOp::Ne(value),
                    "=~" => StreamOp::Re(regex(&value)?),
                    _ => StreamOp::NotRe(regex(&value)?),
                };
                matchers.push(StreamMatcher { name, op });
                if self.lx.eat('}') {
                    break;
                }
                self.lx.expect(',')?;
            }
        }
        Ok(Filter::Stream { matchers })
    }

    fn ident(&mut self) -> String {
        let start = self.lx.pos();
        while self
            .lx
            .peek()
            .is_some_and(|c| c.is_alphanumeric() || matches!(c, '_' | '.' | '-'))
        {
            self.lx.bump();
        }
        self.lx.slice_from(start).to_string()
    }

    // =========================================================================
    // Pipes
    // =========================================================================

    fn pipe(&mut self) -> Result<Pipe, ParseError> {
        self.lx.skip_ws();
        let start = self.lx.pos();
        let name = self.lx.bare(true).to_ascii_lowercase();
        match name.as_str() {
            "filter" | "where" => Ok(Pipe::Filter {
                filter: self.or(MSG_FIELD)?,
            }),
            "fields" => Ok(Pipe::Fields {
                fields: self.name_list()?,
            }),
            "limit" | "head" => {
                let limit = if self.lx.at_end() || self.lx.peek() == Some('|') {
                    DEFAULT_LIMIT
                } else {
                    self.number()?
                };
                Ok(Pipe::Limit { limit })
            }
            "sort" => self.sort(),
            "stats" => self.stats(),
            "facets" => self.facets(),
            other if StatsKind::from_name(other).is_some() => {
                self.lx.reset(start);
                self.stats()
            }
            "" => Err(self.lx.error("missing pipe after '|'")),
            other => Err(ParseError {
                pos: start,
                message: format!("unknown pipe {:?}", other),
            }),
        }
    }

    fn number(&mut self) -> Result<u64, ParseError> {
        let pos = self.lx.pos();
        let text = self.lx.bare(true);
        text.parse().map_err(|_| ParseError {
            pos,
            message: format!("expected a number, got {:?}", text),
        })
    }

    /// `a, b, "c d"` with optional surrounding parentheses.
    fn name_list(&mut self) -> Result<Vec<String>, ParseError> {
        let parens = self.lx.eat('(');
        let mut names = Vec::new();
        loop {
            let name = self.lx.value(false)?;
            if name.is_empty() {
                return Err(self.lx.error("expected a field name"));
            }
            names.push(name);
            if !self.lx.eat(',') {
                break;
            }
        }
        if parens {
            self.lx.expect(')')?;
        }
        Ok(names)
    }

    fn sort(&mut self) -> Result<Pipe, ParseError> {
        self.lx.eat_keyword("by");
        let mut keys = Vec::new();
        if self.lx.eat('(') && !self.lx.eat(')') {
            loop {
                let field = self.lx.value(false)?;
                if field.is_empty() {
                    return Err(self.lx.error("expected a sort field"));
                }
                let desc = if self.lx.eat_keyword("desc") {
                    true
                } else {
                    self.lx.eat_keyword("asc");
                    false
                };
                keys.push(SortKey { field, desc });
                if self.lx.eat(')') {
                    break;
                }
                self.lx.expect(',')?;
            }
        }
        let desc = self.lx.eat_keyword("desc");
        let limit = if self.lx.eat_keyword("limit") {
            Some(self.number()?)
        } else {
            None
        };
        Ok(Pipe::Sort(SortPipe { keys, desc, limit }))
    }

    fn stats(&mut self) -> Result<Pipe, ParseError> {
        let mut by = Vec::new();
        if self.lx.eat_keyword("by") {
            self.lx.expect('(')?;
            if !self.lx.eat(')') {
                loop {
                    let name = self.lx.value(true)?;
                    if name.is_empty() {
                        return Err(self.lx.error("expected a field name in by(...)"));
                    }
                    let mut step = None;
                    if self.lx.peek() == Some(':') {
                        self.lx.bump();
                        let pos = self.lx.pos();
                        let text = self.lx.bare(false);
                        if name != TIME_FIELD {
                            return Err(ParseError {
                                pos,
                                message: format!("only {} can be bucketed", TIME_FIELD),
                            });
                        }
                        step = Some(parse_duration(&text).filter(|d| *d > 0).ok_or(ParseError {
                            pos,
                            message: format!("cannot parse bucket step {:?}", text),
                        })?);
                    }
                    by.push(ByField { name, step });
                    if self.lx.eat(')') {
                        break;
                    }
                    self.lx.expect(',')?;
                }
            }
        }

        let mut funcs = Vec::new();
        loop {
            let pos = self.lx.pos();
            let name = self.lx.bare(true);
            let kind = StatsKind::from_name(&name).ok_or(ParseError {
                pos,
                message: format!("unknown stats function {:?}", name),
            })?;
            self.lx.expect('(')?;
            let mut args = Vec::new();
            if !self.lx.eat(')') {
                loop {
                    args.push(self.lx.value(false)?);
                    if self.lx.eat(')') {
                        break;
                    }
                    self.lx.expect(',')?;
                }
            }
            let mut func = StatsFunc::new(kind, args);
            if self.lx.eat_keyword("as") {
                func.result = self.result_name()?;
            } else if !self.lx.at_end() && !matches!(self.lx.peek(), Some(',' | '|' | ')')) {
                func.result = self.result_name()?;
            }
            funcs.push(func);
            if !self.lx.eat(',') {
                break;
            }
        }
        Ok(Pipe::Stats(StatsPipe { by, funcs }))
    }

    fn result_name(&mut self) -> Result<String, ParseError> {
        let name = self.lx.value(false)?;
        if name.is_empty() {
            return Err(self.lx.error("expected a result name"));
        }
        Ok(name)
    }

    fn facets(&mut self) -> Result<Pipe, ParseError> {
        let mut pipe = FacetsPipe::default();
        while !self.lx.at_end() && self.lx.peek() != Some('|') {
            if self.lx.peek().is_some_and(|c| c.is_ascii_digit()) {
                pipe.limit = self.number()?;
            } else if self.lx.eat_keyword("max_values_per_field") {
                pipe.max_values_per_field = self.number()?;
            } else if self.lx.eat_keyword("max_value_len") {
                pipe.max_value_len = self.number()?;
            } else if self.lx.eat_keyword("keep_const_fields") {
                pipe.keep_const_fields = true;
            } else {
                return Err(self.lx.error(format!("unexpected facets option {:?}", self.lx.rest())));
            }
        }
        Ok(Pipe::Facets(pipe))
    }
}

fn word_filter(field: &str, token: String) -> Filter {
    if token == "*" {
        return Filter::Prefix {
            field: field.to_string(),
            prefix: String::new(),
        };
    }
    match token.strip_suffix('*') {
        Some(prefix) => Filter::Prefix {
            field: field.to_string(),
            prefix: prefix.to_string(),
        },
        None => Filter::Phrase {
            field: field.to_string(),
            phrase: token,
        },
    }
}
