//! Free-variable extraction for alpha expressions.
//!
//! Used before a study starts to learn which data fields an expression
//! reads, so their metadata can be fetched.

use std::collections::BTreeSet;

#[derive(Debug, Clone, PartialEq)]
enum Token<'a> {
    Ident(&'a str),
    Literal,
    Open,
    Close,
    Assign,
    Separator,
    Other,
}

/// Words that are never data fields.
const RESERVED: [&str; 8] = ["and", "or", "not", "if", "else", "true", "false", "none"];

fn tokenize(expr: &str) -> Vec<Token<'_>> {
    let bytes = expr.as_bytes();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < bytes.len() {
        let c = bytes[i];
        match c {
            b' ' | b'\t' | b'\r' => i += 1,
            b'\n' | b';' => {
                tokens.push(Token::Separator);
                i += 1;
            }
            b'(' | b'[' => {
                tokens.push(Token::Open);
                i += 1;
            }
            b')' | b']' => {
                tokens.push(Token::Close);
                i += 1;
            }
            b'"' | b'\'' => {
                i += 1;
                while i < bytes.len() && bytes[i] != c {
                    i += 1;
                }
                i += 1;
                tokens.push(Token::Literal);
            }
            b'0'..=b'9' | b'.' => {
                while i < bytes.len() && (bytes[i].is_ascii_digit() || bytes[i] == b'.') {
                    i += 1;
                }
                if i < bytes.len() && (bytes[i] == b'e' || bytes[i] == b'E') {
                    let mut j = i + 1;
                    if j < bytes.len() && (bytes[j] == b'+' || bytes[j] == b'-') {
                        j += 1;
                    }
                    if j < bytes.len() && bytes[j].is_ascii_digit() {
                        i = j;
                        while i < bytes.len() && bytes[i].is_ascii_digit() {
                            i += 1;
                        }
                    }
                }
                tokens.push(Token::Literal);
            }
            c if c.is_ascii_alphabetic() || c == b'_' => {
                let start = i;
                while i < bytes.len() && (bytes[i].is_ascii_alphanumeric() || bytes[i] == b'_') {
                    i += 1;
                }
                tokens.push(Token::Ident(&expr[start..i]));
            }
            b'=' => {
                if bytes.get(i + 1) == Some(&b'=') {
                    tokens.push(Token::Other);
                    i += 2;
                } else {
                    tokens.push(Token::Assign);
                    i += 1;
                }
            }
            b'!' | b'<' | b'>' if bytes.get(i + 1) == Some(&b'=') => {
                tokens.push(Token::Other);
                i += 2;
            }
            _ => {
                tokens.push(Token::Other);
                // Skip the whole UTF-8 sequence of non-ASCII characters.
                i += expr[i..].chars().next().map_or(1, char::len_utf8);
            }
        }
    }
    tokens
}

/// The sorted set of data fields referenced by `expr`: every identifier
/// except assignment targets, keyword-argument names and function names.
/// `&&` and `||` are accepted as logical operators.
pub fn extract_fields(expr: &str) -> Vec<String> {
    let tokens = tokenize(expr);
    let mut variables = BTreeSet::new();
    let mut assigned = BTreeSet::new();
    let mut functions = BTreeSet::new();
    let mut depth = 0usize;

    for (i, token) in tokens.iter().enumerate() {
        match token {
            Token::Open => depth += 1,
            Token::Close => depth = depth.saturating_sub(1),
            Token::Separator if depth == 0 => {}
            Token::Ident(name) => {
                if RESERVED.contains(&name.to_ascii_lowercase().as_str()) {
                    continue;
                }
                match tokens.get(i + 1) {
                    Some(Token::Open) => {
                        functions.insert(*name);
                    }
                    Some(Token::Assign) if depth == 0 => {
                        assigned.insert(*name);
                    }
                    // keyword argument name
                    Some(Token::Assign) => {}
                    _ => {
                        variables.insert(*name);
                    }
                }
            }
            _ => {}
        }
    }

    variables
        .into_iter()
        .filter(|v| !assigned.contains(v) && !functions.contains(v))
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn simple_ratio() {
        assert_eq!(extract_fields("liabilities / assets"), vec!["assets", "liabilities"]);
    }

    #[test]
    fn excludes_functions_and_assignments() {
        let expr = "a = rank(close);\nb = ts_mean(a, 20);\n-b * volume / cap";
        assert_eq!(extract_fields(expr), vec!["cap", "close", "volume"]);
    }

    #[test]
    fn excludes_keyword_arguments_and_literals() {
        let expr = "ts_decay_linear(returns, 10, dense=false) * 1e-3 + group_neutralize(vwap, subindustry)";
        assert_eq!(extract_fields(expr), vec!["returns", "subindustry", "vwap"]);
    }

    #[test]
    fn logical_operators() {
        let expr = "trade_when(close > open && volume >= adv20 || cap == 0, alpha_x, -1)";
        assert_eq!(
            extract_fields(expr),
            vec!["adv20", "alpha_x", "cap", "close", "open", "volume"]
        );
    }

    #[test]
    fn string_literals_are_ignored() {
        assert_eq!(
            extract_fields(r#"bucket(rank(cap), range="0.1, 1, 0.1")"#),
            vec!["cap"]
        );
    }

    #[test]
    fn name_used_as_function_is_not_a_field() {
        assert_eq!(extract_fields("rank(x) + rank"), vec!["x"]);
    }

    #[test]
    fn result_is_deduplicated_and_sorted() {
        assert_eq!(extract_fields("close - open + close * open"), vec!["close", "open"]);
    }
}
