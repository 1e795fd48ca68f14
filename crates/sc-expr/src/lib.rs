//! Skip-expression evaluator (component B): a small, side-effect-free
//! boolean/arithmetic language over an entry's defines.
//!
//! Grammar (whitespace ignored):
//!   atom   := INT | '$' NAME | "defined" ATOM | '!' ATOM | '(' EXPR ')'
//!   binary := atom (OP atom)*
//!   OP     := '&&' | '||' | '==' | '!=' | '>' | '>=' | '<' | '<='
//!
//! Comparison/equality share priority 0, `&&` is priority 1, `||` is
//! priority 2. A classic shunting-yard stack collapses operators while the
//! incoming operator's priority is *strictly greater* than the one on top
//! of the stack, which yields right-to-left associativity; this is
//! preserved exactly as specified, quirks and all.
//!
//! A malformed expression is not an error: it evaluates to `0` (false).

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Int(i64),
    Var(String),
    Defined,
    Not,
    LParen,
    RParen,
    And,
    Or,
    Eq,
    Ne,
    Gt,
    Ge,
    Lt,
    Le,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum BinOp {
    And,
    Or,
    Eq,
    Ne,
    Gt,
    Ge,
    Lt,
    Le,
}

impl BinOp {
    fn priority(self) -> u8 {
        match self {
            BinOp::Eq | BinOp::Ne | BinOp::Gt | BinOp::Ge | BinOp::Lt | BinOp::Le => 0,
            BinOp::And => 1,
            BinOp::Or => 2,
        }
    }
}

#[derive(Debug, Clone)]
enum Node {
    Const(i64),
    Var(String),
    Defined(Box<Node>),
    Not(Box<Node>),
    Bin(BinOp, Box<Node>, Box<Node>),
}

fn tokenize(src: &str) -> Option<Vec<Token>> {
    let bytes = src.as_bytes();
    let mut i = 0;
    let mut tokens = Vec::new();
    while i < bytes.len() {
        let c = bytes[i] as char;
        if c.is_whitespace() {
            i += 1;
            continue;
        }
        match c {
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            '!' => {
                if bytes.get(i + 1) == Some(&b'=') {
                    tokens.push(Token::Ne);
                    i += 2;
                } else {
                    tokens.push(Token::Not);
                    i += 1;
                }
            }
            '=' => {
                if bytes.get(i + 1) == Some(&b'=') {
                    tokens.push(Token::Eq);
                    i += 2;
                } else {
                    return None; // bare '=' is not a token in this grammar
                }
            }
            '>' => {
                if bytes.get(i + 1) == Some(&b'=') {
                    tokens.push(Token::Ge);
                    i += 2;
                } else {
                    tokens.push(Token::Gt);
                    i += 1;
                }
            }
            '<' => {
                if bytes.get(i + 1) == Some(&b'=') {
                    tokens.push(Token::Le);
                    i += 2;
                } else {
                    tokens.push(Token::Lt);
                    i += 1;
                }
            }
            '&' => {
                if bytes.get(i + 1) == Some(&b'&') {
                    tokens.push(Token::And);
                    i += 2;
                } else {
                    return None;
                }
            }
            '|' => {
                if bytes.get(i + 1) == Some(&b'|') {
                    tokens.push(Token::Or);
                    i += 2;
                } else {
                    return None;
                }
            }
            '$' => {
                let start = i + 1;
                let mut j = start;
                while j < bytes.len() && is_ident_byte(bytes[j]) {
                    j += 1;
                }
                if j == start {
                    return None;
                }
                tokens.push(Token::Var(src[start..j].to_string()));
                i = j;
            }
            c if c.is_ascii_digit() => {
                let start = i;
                let mut j = i;
                while j < bytes.len() && (bytes[j] as char).is_ascii_digit() {
                    j += 1;
                }
                let value: i64 = src[start..j].parse().ok()?;
                tokens.push(Token::Int(value));
                i = j;
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let start = i;
                let mut j = i;
                while j < bytes.len() && is_ident_byte(bytes[j]) {
                    j += 1;
                }
                let word = &src[start..j];
                if word == "defined" {
                    tokens.push(Token::Defined);
                } else {
                    return None; // bare identifiers aren't part of the grammar
                }
                i = j;
            }
            _ => return None,
        }
    }
    Some(tokens)
}

fn is_ident_byte(b: u8) -> bool {
    (b as char).is_ascii_alphanumeric() || b == b'_'
}

struct Parser<'a> {
    tokens: &'a [Token],
    pos: usize,
}

impl<'a> Parser<'a> {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn bump(&mut self) -> Option<&Token> {
        let t = self.tokens.get(self.pos);
        self.pos += 1;
        t
    }

    fn parse_atom(&mut self) -> Option<Node> {
        match self.bump()? {
            Token::Int(v) => Some(Node::Const(*v)),
            Token::Var(name) => Some(Node::Var(name.clone())),
            Token::Defined => self.parse_atom().map(|n| Node::Defined(Box::new(n))),
            Token::Not => self.parse_atom().map(|n| Node::Not(Box::new(n))),
            Token::LParen => {
                let inner = self.parse_expr()?;
                match self.bump() {
                    Some(Token::RParen) => Some(inner),
                    _ => None,
                }
            }
            _ => None,
        }
    }

    fn peek_binop(&self) -> Option<BinOp> {
        match self.peek()? {
            Token::And => Some(BinOp::And),
            Token::Or => Some(BinOp::Or),
            Token::Eq => Some(BinOp::Eq),
            Token::Ne => Some(BinOp::Ne),
            Token::Gt => Some(BinOp::Gt),
            Token::Ge => Some(BinOp::Ge),
            Token::Lt => Some(BinOp::Lt),
            Token::Le => Some(BinOp::Le),
            _ => None,
        }
    }

    /// Classic shunting-yard: collapse the operator stack while the
    /// incoming operator's priority is strictly greater than the top's.
    fn parse_expr(&mut self) -> Option<Node> {
        let mut operands: Vec<Node> = vec![self.parse_atom()?];
        let mut operators: Vec<BinOp> = Vec::new();

        while let Some(op) = self.peek_binop() {
            self.bump();
            while let Some(&top) = operators.last() {
                if op.priority() > top.priority() {
                    operators.pop();
                    let rhs = operands.pop()?;
                    let lhs = operands.pop()?;
                    operands.push(Node::Bin(top, Box::new(lhs), Box::new(rhs)));
                } else {
                    break;
                }
            }
            operators.push(op);
            operands.push(self.parse_atom()?);
        }

        while let Some(top) = operators.pop() {
            let rhs = operands.pop()?;
            let lhs = operands.pop()?;
            operands.push(Node::Bin(top, Box::new(lhs), Box::new(rhs)));
        }

        if operands.len() == 1 {
            operands.pop()
        } else {
            None
        }
    }
}

fn parse(src: &str) -> Option<Node> {
    let tokens = tokenize(src)?;
    let mut parser = Parser {
        tokens: &tokens,
        pos: 0,
    };
    let node = parser.parse_expr()?;
    if parser.pos == tokens.len() {
        Some(node)
    } else {
        None // trailing garbage: treat the whole expression as malformed
    }
}

fn eval_node(node: &Node, env: &dyn Fn(&str) -> i64) -> i64 {
    match node {
        Node::Const(v) => *v,
        Node::Var(name) => env(name),
        Node::Defined(inner) => eval_node(inner, env),
        Node::Not(inner) => bool_to_i64(eval_node(inner, env) == 0),
        Node::Bin(op, lhs, rhs) => {
            let l = eval_node(lhs, env);
            match op {
                BinOp::And => {
                    if l == 0 {
                        0
                    } else {
                        bool_to_i64(eval_node(rhs, env) != 0)
                    }
                }
                BinOp::Or => {
                    if l != 0 {
                        1
                    } else {
                        bool_to_i64(eval_node(rhs, env) != 0)
                    }
                }
                _ => {
                    let r = eval_node(rhs, env);
                    bool_to_i64(match op {
                        BinOp::Eq => l == r,
                        BinOp::Ne => l != r,
                        BinOp::Gt => l > r,
                        BinOp::Ge => l >= r,
                        BinOp::Lt => l < r,
                        BinOp::Le => l <= r,
                        BinOp::And | BinOp::Or => unreachable!(),
                    })
                }
            }
        }
    }
}

fn bool_to_i64(b: bool) -> i64 {
    if b {
        1
    } else {
        0
    }
}

/// Evaluates `expr` against `env` (which must return `0` for unknown
/// variables). Never fails: an unparseable expression evaluates to `0`.
pub fn evaluate(expr: &str, env: &dyn Fn(&str) -> i64) -> i64 {
    match parse(expr) {
        Some(node) => eval_node(&node, env),
        None => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env_from(map: &[(&str, i64)]) -> impl Fn(&str) -> i64 + '_ {
        let table: HashMap<&str, i64> = map.iter().cloned().collect();
        move |name: &str| *table.get(name).unwrap_or(&0)
    }

    #[test]
    fn literal_and_negation() {
        assert_eq!(evaluate("0", &|_| 0), 0);
        assert_eq!(evaluate("1", &|_| 0), 1);
        assert_eq!(evaluate("!0", &|_| 0), 1);
        assert_eq!(evaluate("!1", &|_| 0), 0);
    }

    #[test]
    fn variable_lookup_and_unknown_is_zero() {
        let env = env_from(&[("A", 1), ("B", 0)]);
        assert_eq!(evaluate("$A", &env), 1);
        assert_eq!(evaluate("$B", &env), 0);
        assert_eq!(evaluate("$UNKNOWN", &env), 0);
    }

    #[test]
    fn comparison_and_equality() {
        let env = env_from(&[("B", 1)]);
        assert_eq!(evaluate("$B == 1", &env), 1);
        assert_eq!(evaluate("$B != 1", &env), 0);
        assert_eq!(evaluate("$B > 0", &env), 1);
        assert_eq!(evaluate("$B >= 1", &env), 1);
        assert_eq!(evaluate("$B < 1", &env), 0);
        assert_eq!(evaluate("$B <= 0", &env), 0);
    }

    #[test]
    fn comparisons_bind_tighter_than_logical_ops() {
        let env = env_from(&[("A", 1), ("B", 1), ("C", 0)]);
        // (A==1) && (B==1) -> 1
        assert_eq!(evaluate("$A == 1 && $B == 1", &env), 1);
        // (A==1) || (C==1) -> 1
        assert_eq!(evaluate("$A == 1 || $C == 1", &env), 1);
    }

    #[test]
    fn right_associative_chains() {
        let env = env_from(&[("A", 1), ("B", 0), ("C", 1)]);
        // A && B && C == A && (B && C) == 0
        assert_eq!(evaluate("$A && $B && $C", &env), 0);
        let env2 = env_from(&[("A", 1), ("B", 1), ("C", 1)]);
        assert_eq!(evaluate("$A && $B && $C", &env2), 1);
    }

    #[test]
    fn defined_is_transparent() {
        let env = env_from(&[("A", 5)]);
        assert_eq!(evaluate("defined $A", &env), 5);
    }

    #[test]
    fn parens_override() {
        let env = env_from(&[("A", 0), ("B", 1), ("C", 1)]);
        assert_eq!(evaluate("$A || ($B && $C)", &env), 1);
    }

    #[test]
    fn malformed_expression_is_false_not_error() {
        assert_eq!(evaluate("(((", &|_| 0), 0);
        assert_eq!(evaluate("$A &&", &|_| 0), 0);
        assert_eq!(evaluate("1 ) extra", &|_| 0), 0);
        assert_eq!(evaluate("", &|_| 0), 0);
    }
}
