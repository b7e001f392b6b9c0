//! Wildcard patterns for subscriptions, persist rules and history queries.
//!
//! `*` matches any run of characters (including none), `?` matches exactly
//! one character, every other character is literal. Matching is anchored
//! at both ends. The empty pattern is the only rejected input.

use std::fmt;

use crate::utils::error::{BrokerError, BrokerResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Token {
    Literal(char),
    AnyRun,
    AnyOne,
}

/// A pattern compiled once at registration time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pattern {
    source: String,
    tokens: Vec<Token>,
    literal: bool,
}

impl Pattern {
    pub fn compile(source: &str) -> BrokerResult<Self> {
        if source.is_empty() {
            return Err(BrokerError::InvalidPattern {
                pattern: source.to_string(),
                reason: "pattern cannot be empty",
            });
        }

        let mut tokens = Vec::with_capacity(source.len());
        for c in source.chars() {
            let token = match c {
                '*' => Token::AnyRun,
                '?' => Token::AnyOne,
                other => Token::Literal(other),
            };
            // consecutive stars collapse into one
            if token == Token::AnyRun && tokens.last() == Some(&Token::AnyRun) {
                continue;
            }
            tokens.push(token);
        }

        let literal = tokens.iter().all(|t| matches!(t, Token::Literal(_)));

        Ok(Self {
            source: source.to_string(),
            tokens,
            literal,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }

    /// True when the pattern has no metacharacters.
    pub fn is_literal(&self) -> bool {
        self.literal
    }

    pub fn matches(&self, text: &str) -> bool {
        if self.literal {
            return self.source == text;
        }

        let text: Vec<char> = text.chars().collect();
        let (mut p, mut t) = (0usize, 0usize);
        // position of the last `*` seen and the text index it was tried at
        let mut backtrack: Option<(usize, usize)> = None;

        while t < text.len() {
            match self.tokens.get(p) {
                Some(Token::AnyOne) => {
                    p += 1;
                    t += 1;
                }
                Some(Token::Literal(c)) if *c == text[t] => {
                    p += 1;
                    t += 1;
                }
                Some(Token::AnyRun) => {
                    backtrack = Some((p, t));
                    p += 1;
                }
                _ => match backtrack {
                    Some((star, start)) => {
                        p = star + 1;
                        t = start + 1;
                        backtrack = Some((star, start + 1));
                    }
                    None => return false,
                },
            }
        }

        self.tokens[p..].iter().all(|t| *t == Token::AnyRun)
    }
}

impl fmt::Display for Pattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}
