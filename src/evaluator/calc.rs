//! `calc`: a small arithmetic language used as the default back-end.
//!
//! ```text
//! let r = 2
//! print(r * 3)      // writes "6" to stdout
//! display(r + 1)    // publishes display_data
//! r * r             // last expression becomes the execute_result: 4
//! ```
//!
//! Statements are separated by newlines or `;`. Numbers are `f64`. Operators
//! are `+ - * / %`, unary minus and parentheses. `//` starts a comment.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use super::{Completion, DisplayHandle, Evaluator, HelpLink, KernelInfo, LanguageInfo, OutErr};
use crate::data::Data;
use crate::types::{Error, Result};

const KEYWORDS: &[&str] = &["display", "let", "print"];

/// Deepest expression tree the parser builds. Parsing, evaluation and drop
/// all recurse over the tree.
const MAX_DEPTH: usize = 256;

const HELP: &str = "\
calc special commands:
    %help            print this help
    %reset           forget every variable
    $command args    run a shell command, output goes to the notebook

statements:
    let NAME = EXPR  bind a variable
    print(EXPR)      write the value to stdout
    display(EXPR)    show the value as rich output
    EXPR             the last expression is the cell result
";

/// Evaluator for the `calc` language. Variables persist across executions.
#[derive(Debug, Default)]
pub struct CalcEvaluator {
    vars: Mutex<BTreeMap<String, f64>>,
    display: Mutex<Option<DisplayHandle>>,
}

impl CalcEvaluator {
    pub fn new() -> Self {
        Self::default()
    }

    fn vars(&self) -> MutexGuard<'_, BTreeMap<String, f64>> {
        self.vars.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn display_handle(&self) -> Option<DisplayHandle> {
        self.display
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl Evaluator for CalcEvaluator {
    fn kernel_info(&self) -> KernelInfo {
        let mut info = KernelInfo::new(
            "kernelkit",
            env!("CARGO_PKG_VERSION"),
            LanguageInfo {
                name: "calc".to_string(),
                version: env!("CARGO_PKG_VERSION").to_string(),
                mimetype: "text/x-calc".to_string(),
                file_extension: ".calc".to_string(),
                pygments_lexer: None,
                codemirror_mode: None,
            },
        );
        info.banner = format!("kernelkit calc {}", env!("CARGO_PKG_VERSION"));
        info.help_links = vec![HelpLink {
            text: "Jupyter messaging".to_string(),
            url: "https://jupyter-client.readthedocs.io/en/latest/messaging.html".to_string(),
        }];
        info
    }

    fn complete(&self, code: &str, cursor_pos: usize) -> Completion {
        let before: Vec<char> = code.chars().take(cursor_pos).collect();
        let cursor = before.len();
        let start = before
            .iter()
            .rposition(|c| !is_ident_char(*c))
            .map_or(0, |i| i + 1);
        let prefix: String = before[start..].iter().collect();
        if prefix.chars().next().is_some_and(|c| c.is_ascii_digit()) {
            return Completion {
                cursor_start: cursor,
                cursor_end: cursor,
                matches: Vec::new(),
            };
        }

        let vars = self.vars();
        let mut matches: Vec<String> = KEYWORDS
            .iter()
            .map(|k| k.to_string())
            .chain(vars.keys().cloned())
            .filter(|name| name.starts_with(&prefix))
            .collect();
        matches.sort();
        matches.dedup();

        Completion {
            cursor_start: start,
            cursor_end: cursor,
            matches,
        }
    }

    fn setup_display(&self, display: DisplayHandle) {
        *self.display.lock().unwrap_or_else(PoisonError::into_inner) = Some(display);
    }

    fn teardown_display(&self) {
        *self.display.lock().unwrap_or_else(PoisonError::into_inner) = None;
    }

    async fn run_directive(&self, line: &str, out_err: &OutErr) -> Result<()> {
        let name = line.split_whitespace().next().unwrap_or("");
        match name {
            "help" => {
                out_err.out.write_text(HELP);
                Ok(())
            }
            "reset" => {
                self.vars().clear();
                Ok(())
            }
            _ => Err(Error::evaluation(format!(
                "unknown special command: \"%{}\"\n{}",
                line, HELP
            ))),
        }
    }

    async fn evaluate(&self, code: &str, out_err: &OutErr) -> Result<Data> {
        let mut last = None;
        for statement in split_statements(code) {
            let parsed = parse_statement(statement).map_err(Error::evaluation)?;
            last = None;
            match parsed {
                Statement::Let(name, expr) => {
                    let value = self.eval(&expr)?;
                    self.vars().insert(name, value);
                }
                Statement::Print(expr) => {
                    let value = self.eval(&expr)?;
                    out_err.out.write_text(format!("{}\n", format_number(value)));
                }
                Statement::Display(expr) => {
                    let value = self.eval(&expr)?;
                    let display = self.display_handle().ok_or_else(|| {
                        Error::evaluation("cannot display: connection with Jupyter not available")
                    })?;
                    display.display(&Data::text(format_number(value))).await?;
                }
                Statement::Expr(expr) => last = Some(self.eval(&expr)?),
            }
        }
        Ok(last.map(|v| Data::text(format_number(v))).unwrap_or_default())
    }
}

impl CalcEvaluator {
    fn eval(&self, expr: &Expr) -> Result<f64> {
        let vars = self.vars();
        eval_expr(expr, &vars).map_err(Error::evaluation)
    }
}

fn is_ident_char(c: char) -> bool {
    c.is_alphanumeric() || c == '_'
}

/// Integral values print without a fractional part.
fn format_number(value: f64) -> String {
    if value.fract() == 0.0 && value.abs() < 1e15 {
        format!("{}", value as i64)
    } else {
        format!("{}", value)
    }
}

fn split_statements(code: &str) -> impl Iterator<Item = &str> {
    code.split('\n')
        .map(|line| line.split_once("//").map_or(line, |(code, _)| code))
        .flat_map(|line| line.split(';'))
        .map(str::trim)
        .filter(|s| !s.is_empty())
}

// Parsing

#[derive(Debug, Clone, PartialEq)]
enum Expr {
    Number(f64),
    Var(String),
    Neg(Box<Expr>),
    Binary(Box<Expr>, char, Box<Expr>),
}

#[derive(Debug, Clone, PartialEq)]
enum Statement {
    Let(String, Expr),
    Print(Expr),
    Display(Expr),
    Expr(Expr),
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Number(f64),
    Ident(String),
    Op(char),
    LParen,
    RParen,
    Assign,
}

fn tokenize(src: &str) -> std::result::Result<Vec<Token>, String> {
    let mut tokens = Vec::new();
    let mut chars = src.char_indices().peekable();
    while let Some(&(i, c)) = chars.peek() {
        match c {
            c if c.is_whitespace() => {
                chars.next();
            }
            '0'..='9' | '.' => {
                let mut end = i;
                while let Some(&(j, d)) = chars.peek() {
                    if d.is_ascii_digit() || d == '.' {
                        end = j + d.len_utf8();
                        chars.next();
                    } else {
                        break;
                    }
                }
                let text = &src[i..end];
                let value = text
                    .parse::<f64>()
                    .map_err(|_| format!("invalid number: {}", text))?;
                tokens.push(Token::Number(value));
            }
            c if c.is_alphabetic() || c == '_' => {
                let mut end = i;
                while let Some(&(j, d)) = chars.peek() {
                    if is_ident_char(d) {
                        end = j + d.len_utf8();
                        chars.next();
                    } else {
                        break;
                    }
                }
                tokens.push(Token::Ident(src[i..end].to_string()));
            }
            '+' | '-' | '*' | '/' | '%' => {
                tokens.push(Token::Op(c));
                chars.next();
            }
            '(' => {
                tokens.push(Token::LParen);
                chars.next();
            }
            ')' => {
                tokens.push(Token::RParen);
                chars.next();
            }
            '=' => {
                tokens.push(Token::Assign);
                chars.next();
            }
            other => return Err(format!("unexpected character: {:?}", other)),
        }
    }
    Ok(tokens)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    depth: usize,
}

impl Parser {
    fn new(tokens: Vec<Token>) -> Self {
        Self {
            tokens,
            pos: 0,
            depth: 0,
        }
    }

    fn enter(&mut self) -> std::result::Result<(), String> {
        self.depth += 1;
        if self.depth > MAX_DEPTH {
            return Err("expression nested too deeply".to_string());
        }
        Ok(())
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        token
    }

    fn expect(&mut self, want: Token) -> std::result::Result<(), String> {
        match self.next() {
            Some(ref t) if *t == want => Ok(()),
            Some(t) => Err(format!("expected {:?}, found {:?}", want, t)),
            None => Err(format!("expected {:?}, found end of input", want)),
        }
    }

    fn finish(&self) -> std::result::Result<(), String> {
        match self.peek() {
            None => Ok(()),
            Some(t) => Err(format!("unexpected {:?}", t)),
        }
    }

    // expr := term (('+' | '-') term)*
    fn expr(&mut self) -> std::result::Result<Expr, String> {
        let base = self.depth;
        let mut lhs = self.term()?;
        while let Some(Token::Op(op @ ('+' | '-'))) = self.peek().cloned() {
            self.pos += 1;
            self.enter()?;
            let rhs = self.term()?;
            lhs = Expr::Binary(Box::new(lhs), op, Box::new(rhs));
        }
        self.depth = base;
        Ok(lhs)
    }

    // term := unary (('*' | '/' | '%') unary)*
    fn term(&mut self) -> std::result::Result<Expr, String> {
        let base = self.depth;
        let mut lhs = self.unary()?;
        while let Some(Token::Op(op @ ('*' | '/' | '%'))) = self.peek().cloned() {
            self.pos += 1;
            self.enter()?;
            let rhs = self.unary()?;
            lhs = Expr::Binary(Box::new(lhs), op, Box::new(rhs));
        }
        self.depth = base;
        Ok(lhs)
    }

    fn unary(&mut self) -> std::result::Result<Expr, String> {
        if self.peek() == Some(&Token::Op('-')) {
            self.pos += 1;
            self.enter()?;
            let inner = self.unary()?;
            self.depth -= 1;
            return Ok(Expr::Neg(Box::new(inner)));
        }
        self.primary()
    }

    fn primary(&mut self) -> std::result::Result<Expr, String> {
        match self.next() {
            Some(Token::Number(n)) => Ok(Expr::Number(n)),
            Some(Token::Ident(name)) => Ok(Expr::Var(name)),
            Some(Token::LParen) => {
                self.enter()?;
                let inner = self.expr()?;
                self.expect(Token::RParen)?;
                self.depth -= 1;
                Ok(inner)
            }
            Some(t) => Err(format!("unexpected {:?}", t)),
            None => Err("unexpected end of input".to_string()),
        }
    }

    fn call_argument(&mut self) -> std::result::Result<Expr, String> {
        self.expect(Token::LParen)?;
        let arg = self.expr()?;
        self.expect(Token::RParen)?;
        Ok(arg)
    }
}

fn parse_statement(src: &str) -> std::result::Result<Statement, String> {
    let tokens = tokenize(src)?;
    let mut parser = Parser::new(tokens);

    let keyword = match parser.peek() {
        Some(Token::Ident(name)) if KEYWORDS.contains(&name.as_str()) => Some(name.clone()),
        _ => None,
    };

    let statement = match keyword.as_deref() {
        Some("let") => {
            parser.pos = 1;
            let Some(Token::Ident(name)) = parser.next() else {
                return Err("expected a name after let".to_string());
            };
            if KEYWORDS.contains(&name.as_str()) {
                return Err(format!("cannot bind keyword {:?}", name));
            }
            parser.expect(Token::Assign)?;
            Statement::Let(name, parser.expr()?)
        }
        Some("print") => {
            parser.pos = 1;
            Statement::Print(parser.call_argument()?)
        }
        Some("display") => {
            parser.pos = 1;
            Statement::Display(parser.call_argument()?)
        }
        _ => Statement::Expr(parser.expr()?),
    };
    parser.finish()?;
    Ok(statement)
}

fn eval_expr(expr: &Expr, vars: &BTreeMap<String, f64>) -> std::result::Result<f64, String> {
    match expr {
        Expr::Number(n) => Ok(*n),
        Expr::Var(name) => vars
            .get(name)
            .copied()
            .ok_or_else(|| format!("undefined variable: {}", name)),
        Expr::Neg(inner) => Ok(-eval_expr(inner, vars)?),
        Expr::Binary(lhs, op, rhs) => {
            let a = eval_expr(lhs, vars)?;
            let b = eval_expr(rhs, vars)?;
            match op {
                '+' => Ok(a + b),
                '-' => Ok(a - b),
                '*' => Ok(a * b),
                '/' | '%' if b == 0.0 => Err("division by zero".to_string()),
                '/' => Ok(a / b),
                '%' => Ok(a % b),
                other => Err(format!("unknown operator {:?}", other)),
            }
        }
    }
}
