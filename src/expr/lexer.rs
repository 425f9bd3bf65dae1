//! Tokenizer for the expression language

use super::ExpressionError;

/// A lexical token
#[derive(Debug, Clone, PartialEq)]
pub enum Token {
    Number(f64),
    Str(String),
    Ident(String),
    True,
    False,
    Null,
    Undefined,
    Dot,
    Comma,
    LParen,
    RParen,
    LBracket,
    RBracket,
    Question,
    Colon,
    Not,
    And,
    Or,
    Eq,
    NotEq,
    StrictEq,
    StrictNotEq,
    Lt,
    LtEq,
    Gt,
    GtEq,
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
}

/// Split an expression into tokens
pub fn tokenize(source: &str) -> Result<Vec<Token>, ExpressionError> {
    let chars: Vec<char> = source.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];

        if c.is_whitespace() {
            i += 1;
            continue;
        }

        if c.is_ascii_digit() {
            let start = i;
            while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                // `1.foo` is not a number followed by a member
                if chars[i] == '.' && !chars.get(i + 1).is_some_and(|n| n.is_ascii_digit()) {
                    break;
                }
                i += 1;
            }
            let text: String = chars[start..i].iter().collect();
            let value = text
                .parse::<f64>()
                .map_err(|_| ExpressionError::Syntax(format!("Invalid number '{}'", text)))?;
            tokens.push(Token::Number(value));
            continue;
        }

        if c.is_alphabetic() || c == '_' || c == '$' {
            let start = i;
            while i < chars.len()
                && (chars[i].is_alphanumeric() || chars[i] == '_' || chars[i] == '$')
            {
                i += 1;
            }
            let word: String = chars[start..i].iter().collect();
            tokens.push(match word.as_str() {
                "true" => Token::True,
                "false" => Token::False,
                "null" => Token::Null,
                "undefined" => Token::Undefined,
                _ => Token::Ident(word),
            });
            continue;
        }

        if c == '\'' || c == '"' || c == '`' {
            let (text, next) = read_string(&chars, i)?;
            tokens.push(Token::Str(text));
            i = next;
            continue;
        }

        let next = chars.get(i + 1).copied();
        let next2 = chars.get(i + 2).copied();
        let (token, width) = match (c, next, next2) {
            ('=', Some('='), Some('=')) => (Token::StrictEq, 3),
            ('!', Some('='), Some('=')) => (Token::StrictNotEq, 3),
            ('=', Some('='), _) => (Token::Eq, 2),
            ('!', Some('='), _) => (Token::NotEq, 2),
            ('<', Some('='), _) => (Token::LtEq, 2),
            ('>', Some('='), _) => (Token::GtEq, 2),
            ('&', Some('&'), _) => (Token::And, 2),
            ('|', Some('|'), _) => (Token::Or, 2),
            ('!', _, _) => (Token::Not, 1),
            ('<', _, _) => (Token::Lt, 1),
            ('>', _, _) => (Token::Gt, 1),
            ('.', _, _) => (Token::Dot, 1),
            (',', _, _) => (Token::Comma, 1),
            ('(', _, _) => (Token::LParen, 1),
            (')', _, _) => (Token::RParen, 1),
            ('[', _, _) => (Token::LBracket, 1),
            (']', _, _) => (Token::RBracket, 1),
            ('?', _, _) => (Token::Question, 1),
            (':', _, _) => (Token::Colon, 1),
            ('+', _, _) => (Token::Plus, 1),
            ('-', _, _) => (Token::Minus, 1),
            ('*', _, _) => (Token::Star, 1),
            ('/', _, _) => (Token::Slash, 1),
            ('%', _, _) => (Token::Percent, 1),
            _ => {
                return Err(ExpressionError::Syntax(format!(
                    "Unexpected character '{}' at offset {}",
                    c, i
                )))
            }
        };
        tokens.push(token);
        i += width;
    }

    Ok(tokens)
}

/// Read a quoted string starting at `start`, returning its text and the
/// index just past the closing quote
fn read_string(chars: &[char], start: usize) -> Result<(String, usize), ExpressionError> {
    let quote = chars[start];
    let mut text = String::new();
    let mut i = start + 1;

    while i < chars.len() {
        match chars[i] {
            '\\' => {
                let escaped = chars.get(i + 1).ok_or_else(|| {
                    ExpressionError::Syntax("Unterminated escape in string".to_string())
                })?;
                text.push(match escaped {
                    'n' => '\n',
                    't' => '\t',
                    'r' => '\r',
                    other => *other,
                });
                i += 2;
            }
            c if c == quote => return Ok((text, i + 1)),
            c => {
                text.push(c);
                i += 1;
            }
        }
    }

    Err(ExpressionError::Syntax("Unterminated string literal".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tokenize_comparison() {
        let tokens = tokenize("res.code === 200").unwrap();
        assert_eq!(
            tokens,
            vec![
                Token::Ident("res".to_string()),
                Token::Dot,
                Token::Ident("code".to_string()),
                Token::StrictEq,
                Token::Number(200.0),
            ]
        );
    }

    #[test]
    fn test_tokenize_strings_and_escapes() {
        let tokens = tokenize(r#"'it\'s' + "a\"b""#).unwrap();
        assert_eq!(
            tokens,
            vec![
                Token::Str("it's".to_string()),
                Token::Plus,
                Token::Str("a\"b".to_string()),
            ]
        );
    }

    #[test]
    fn test_tokenize_decimal_and_member() {
        assert_eq!(tokenize("1.5").unwrap(), vec![Token::Number(1.5)]);
        assert_eq!(
            tokenize("items[0].id").unwrap()[2],
            Token::Number(0.0)
        );
    }

    #[test]
    fn test_tokenize_rejects_unknown_character() {
        assert!(tokenize("a # b").is_err());
        assert!(tokenize("'open").is_err());
    }
}
