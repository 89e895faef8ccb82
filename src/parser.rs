//! Recursive-descent parser (`§4.2`) producing [`crate::ast`] nodes.
//!
//! Binary-operator precedence follows the reference manual's table
//! (`or` < `and` < comparisons < `|` < `~` < `&` < shifts < `..` < `+ -`
//! < `* / // %` < unary < `^`), with `^` and `..` right-associative.

use crate::ast::*;
use crate::error::{syntax_error, Result};
use crate::lexer::{Lexer, Token, TokenWithLocation};
use crate::value::VarAttrib;

pub struct Parser<'a> {
    lexer: Lexer<'a>,
    current: TokenWithLocation,
    chunk_name: String,
}

impl<'a> Parser<'a> {
    pub fn new(src: &'a [u8], chunk_name: impl Into<String>) -> Result<Self> {
        let mut lexer = Lexer::new(src);
        let current = lexer.next_token()?;
        Ok(Parser { lexer, current, chunk_name: chunk_name.into() })
    }

    pub fn parse_chunk(mut self) -> Result<FunctionBody> {
        let block = self.block()?;
        self.expect_eof()?;
        Ok(FunctionBody { params: Vec::new(), is_vararg: true, block, line: 0, last_line: self.current.line })
    }

    fn line(&self) -> u32 {
        self.current.line
    }

    fn advance(&mut self) -> Result<TokenWithLocation> {
        let next = self.lexer.next_token()?;
        Ok(std::mem::replace(&mut self.current, next))
    }

    fn check(&self, tok: &Token) -> bool {
        &self.current.token == tok
    }

    fn accept(&mut self, tok: &Token) -> Result<bool> {
        if self.check(tok) {
            self.advance()?;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    fn expect(&mut self, tok: Token) -> Result<()> {
        if self.check(&tok) {
            self.advance()?;
            Ok(())
        } else {
            Err(syntax_error(format!("'{:?}' expected near '{:?}'", tok, self.current.token), self.line()))
        }
    }

    fn expect_eof(&mut self) -> Result<()> {
        if self.check(&Token::Eof) {
            Ok(())
        } else {
            Err(syntax_error(format!("'<eof>' expected near '{:?}'", self.current.token), self.line()))
        }
    }

    fn expect_name(&mut self) -> Result<String> {
        match self.current.token.clone() {
            Token::Name(n) => {
                self.advance()?;
                Ok(n)
            }
            _ => Err(syntax_error(format!("<name> expected near '{:?}'", self.current.token), self.line())),
        }
    }

    fn block_follow(&self) -> bool {
        matches!(
            self.current.token,
            Token::Eof | Token::End | Token::Else | Token::Elseif | Token::Until
        )
    }

    fn block(&mut self) -> Result<Block> {
        let mut statements = Vec::new();
        while !self.block_follow() {
            if self.check(&Token::Return) {
                statements.push(self.return_stat()?);
                break;
            }
            if let Some(stat) = self.statement()? {
                statements.push(stat);
            }
        }
        Ok(Block { statements })
    }

    fn return_stat(&mut self) -> Result<Stat> {
        let line = self.line();
        self.advance()?;
        let mut values = Vec::new();
        if !self.block_follow() && !self.check(&Token::Semi) {
            values.push(self.expr()?);
            while self.accept(&Token::Comma)? {
                values.push(self.expr()?);
            }
        }
        self.accept(&Token::Semi)?;
        Ok(Stat::Return { values, line })
    }

    fn statement(&mut self) -> Result<Option<Stat>> {
        let line = self.line();
        match &self.current.token {
            Token::Semi => {
                self.advance()?;
                Ok(None)
            }
            Token::If => Ok(Some(self.if_stat()?)),
            Token::While => Ok(Some(self.while_stat()?)),
            Token::Do => {
                self.advance()?;
                let block = self.block()?;
                self.expect(Token::End)?;
                Ok(Some(Stat::Do(block)))
            }
            Token::For => Ok(Some(self.for_stat()?)),
            Token::Repeat => Ok(Some(self.repeat_stat()?)),
            Token::Function => Ok(Some(self.function_stat()?)),
            Token::Local => Ok(Some(self.local_stat()?)),
            Token::DColon => {
                self.advance()?;
                let name = self.expect_name()?;
                self.expect(Token::DColon)?;
                Ok(Some(Stat::Label(name)))
            }
            Token::Break => {
                self.advance()?;
                Ok(Some(Stat::Break(line)))
            }
            Token::Goto => {
                self.advance()?;
                let label = self.expect_name()?;
                Ok(Some(Stat::Goto { label, line }))
            }
            _ => Ok(Some(self.expr_stat()?)),
        }
    }

    fn if_stat(&mut self) -> Result<Stat> {
        let line = self.line();
        self.advance()?;
        let mut arms = Vec::new();
        let cond = self.expr()?;
        self.expect(Token::Then)?;
        let body = self.block()?;
        arms.push((cond, body));
        while self.check(&Token::Elseif) {
            self.advance()?;
            let cond = self.expr()?;
            self.expect(Token::Then)?;
            let body = self.block()?;
            arms.push((cond, body));
        }
        let else_block = if self.accept(&Token::Else)? { Some(self.block()?) } else { None };
        self.expect(Token::End)?;
        Ok(Stat::If { arms, else_block, line })
    }

    fn while_stat(&mut self) -> Result<Stat> {
        let line = self.line();
        self.advance()?;
        let cond = self.expr()?;
        self.expect(Token::Do)?;
        let body = self.block()?;
        self.expect(Token::End)?;
        Ok(Stat::While { cond, body, line })
    }

    fn repeat_stat(&mut self) -> Result<Stat> {
        let line = self.line();
        self.advance()?;
        let body = self.block()?;
        self.expect(Token::Until)?;
        let cond = self.expr()?;
        Ok(Stat::Repeat { body, cond, line })
    }

    fn for_stat(&mut self) -> Result<Stat> {
        let line = self.line();
        self.advance()?;
        let first = self.expect_name()?;
        if self.check(&Token::Assign) {
            self.advance()?;
            let start = self.expr()?;
            self.expect(Token::Comma)?;
            let limit = self.expr()?;
            let step = if self.accept(&Token::Comma)? { Some(self.expr()?) } else { None };
            self.expect(Token::Do)?;
            let body = self.block()?;
            self.expect(Token::End)?;
            Ok(Stat::NumericFor { var: first, start, limit, step, body, line })
        } else {
            let mut names = vec![first];
            while self.accept(&Token::Comma)? {
                names.push(self.expect_name()?);
            }
            self.expect(Token::In)?;
            let mut exprs = vec![self.expr()?];
            while self.accept(&Token::Comma)? {
                exprs.push(self.expr()?);
            }
            self.expect(Token::Do)?;
            let body = self.block()?;
            self.expect(Token::End)?;
            Ok(Stat::GenericFor { names, exprs, body, line })
        }
    }

    fn function_stat(&mut self) -> Result<Stat> {
        let line = self.line();
        self.advance()?;
        let base = self.expect_name()?;
        let mut path = Vec::new();
        while self.accept(&Token::Dot)? {
            path.push(self.expect_name()?);
        }
        let is_method = self.accept(&Token::Colon)?;
        if is_method {
            path.push(self.expect_name()?);
        }
        let body = self.function_body(is_method, line)?;
        Ok(Stat::FunctionDecl { target: FunctionName { base, path }, is_method, body, line })
    }

    fn function_body(&mut self, is_method: bool, line: u32) -> Result<FunctionBody> {
        self.expect(Token::LParen)?;
        let mut params = Vec::new();
        if is_method {
            params.push("self".to_string());
        }
        let mut is_vararg = false;
        if !self.check(&Token::RParen) {
            loop {
                if self.check(&Token::Ellipsis) {
                    self.advance()?;
                    is_vararg = true;
                    break;
                }
                params.push(self.expect_name()?);
                if !self.accept(&Token::Comma)? {
                    break;
                }
            }
        }
        self.expect(Token::RParen)?;
        let block = self.block()?;
        let last_line = self.line();
        self.expect(Token::End)?;
        Ok(FunctionBody { params, is_vararg, block, line, last_line })
    }

    fn local_stat(&mut self) -> Result<Stat> {
        let line = self.line();
        self.advance()?;
        if self.accept(&Token::Function)? {
            let name = self.expect_name()?;
            let body = self.function_body(false, line)?;
            return Ok(Stat::LocalFunction { name, body });
        }
        let mut names = Vec::new();
        loop {
            let name = self.expect_name()?;
            let attrib = if self.accept(&Token::Lt)? {
                let a = self.expect_name()?;
                self.expect(Token::Gt)?;
                match a.as_str() {
                    "const" => VarAttrib::Const,
                    "close" => VarAttrib::Close,
                    other => return Err(syntax_error(format!("unknown attribute '{}'", other), line)),
                }
            } else {
                VarAttrib::None
            };
            names.push((name, attrib));
            if !self.accept(&Token::Comma)? {
                break;
            }
        }
        let values = if self.accept(&Token::Assign)? {
            let mut values = vec![self.expr()?];
            while self.accept(&Token::Comma)? {
                values.push(self.expr()?);
            }
            values
        } else {
            Vec::new()
        };
        Ok(Stat::Local { names, values, line })
    }

    fn expr_stat(&mut self) -> Result<Stat> {
        let line = self.line();
        let first = self.suffixed_expr()?;
        if self.check(&Token::Assign) || self.check(&Token::Comma) {
            let mut targets = vec![first];
            while self.accept(&Token::Comma)? {
                targets.push(self.suffixed_expr()?);
            }
            self.expect(Token::Assign)?;
            let mut values = vec![self.expr()?];
            while self.accept(&Token::Comma)? {
                values.push(self.expr()?);
            }
            Ok(Stat::Assign { targets, values, line })
        } else {
            match &first {
                Expr::Call { .. } | Expr::MethodCall { .. } => Ok(Stat::Call(first)),
                _ => Err(syntax_error("syntax error (statement has no effect)", line)),
            }
        }
    }

    // ----- expressions -----

    fn expr(&mut self) -> Result<Expr> {
        self.binary_expr(0)
    }

    fn binary_expr(&mut self, min_prec: u8) -> Result<Expr> {
        let line = self.line();
        let mut lhs = if let Some(op) = unary_op(&self.current.token) {
            self.advance()?;
            let operand = self.binary_expr(UNARY_PRECEDENCE)?;
            Expr::Unary { op, operand: Box::new(operand), line }
        } else {
            self.simple_expr()?
        };

        loop {
            let Some((op, left_prec, right_prec)) = binary_op(&self.current.token) else { break };
            if left_prec < min_prec {
                break;
            }
            let line = self.line();
            self.advance()?;
            let rhs = self.binary_expr(right_prec)?;
            lhs = Expr::Binary { op, lhs: Box::new(lhs), rhs: Box::new(rhs), line };
        }
        Ok(lhs)
    }

    fn simple_expr(&mut self) -> Result<Expr> {
        let line = self.line();
        let expr = match self.current.token.clone() {
            Token::Nil => {
                self.advance()?;
                Expr::Nil
            }
            Token::True => {
                self.advance()?;
                Expr::True
            }
            Token::False => {
                self.advance()?;
                Expr::False
            }
            Token::Int(i) => {
                self.advance()?;
                Expr::Int(i)
            }
            Token::Float(f) => {
                self.advance()?;
                Expr::Float(f)
            }
            Token::Str(s) => {
                self.advance()?;
                Expr::Str(s)
            }
            Token::Ellipsis => {
                self.advance()?;
                Expr::Vararg
            }
            Token::Function => {
                self.advance()?;
                Expr::Function(self.function_body(false, line)?)
            }
            Token::LBrace => self.table_constructor()?,
            _ => return self.suffixed_expr(),
        };
        Ok(expr)
    }

    fn primary_expr(&mut self) -> Result<Expr> {
        let line = self.line();
        match self.current.token.clone() {
            Token::Name(n) => {
                self.advance()?;
                Ok(Expr::Name(n))
            }
            Token::LParen => {
                self.advance()?;
                let inner = self.expr()?;
                self.expect(Token::RParen)?;
                Ok(Expr::Paren(Box::new(inner)))
            }
            _ => Err(syntax_error(format!("unexpected symbol near '{:?}'", self.current.token), line)),
        }
    }

    fn suffixed_expr(&mut self) -> Result<Expr> {
        let mut expr = self.primary_expr()?;
        loop {
            let line = self.line();
            match &self.current.token {
                Token::Dot => {
                    self.advance()?;
                    let name = self.expect_name()?;
                    expr = Expr::Index { object: Box::new(expr), key: Box::new(Expr::Str(name.into_bytes())), line };
                }
                Token::LBracket => {
                    self.advance()?;
                    let key = self.expr()?;
                    self.expect(Token::RBracket)?;
                    expr = Expr::Index { object: Box::new(expr), key: Box::new(key), line };
                }
                Token::Colon => {
                    self.advance()?;
                    let method = self.expect_name()?;
                    let args = self.call_args()?;
                    expr = Expr::MethodCall { object: Box::new(expr), method, args, line };
                }
                Token::LParen | Token::Str(_) | Token::LBrace => {
                    let args = self.call_args()?;
                    expr = Expr::Call { callee: Box::new(expr), args, line };
                }
                _ => break,
            }
        }
        Ok(expr)
    }

    fn call_args(&mut self) -> Result<Vec<Expr>> {
        match self.current.token.clone() {
            Token::LParen => {
                self.advance()?;
                let mut args = Vec::new();
                if !self.check(&Token::RParen) {
                    args.push(self.expr()?);
                    while self.accept(&Token::Comma)? {
                        args.push(self.expr()?);
                    }
                }
                self.expect(Token::RParen)?;
                Ok(args)
            }
            Token::Str(s) => {
                self.advance()?;
                Ok(vec![Expr::Str(s)])
            }
            Token::LBrace => Ok(vec![self.table_constructor()?]),
            _ => Err(syntax_error("function arguments expected", self.line())),
        }
    }

    fn table_constructor(&mut self) -> Result<Expr> {
        let line = self.line();
        self.expect(Token::LBrace)?;
        let mut fields = Vec::new();
        while !self.check(&Token::RBrace) {
            match &self.current.token {
                Token::LBracket => {
                    self.advance()?;
                    let key = self.expr()?;
                    self.expect(Token::RBracket)?;
                    self.expect(Token::Assign)?;
                    let value = self.expr()?;
                    fields.push(TableField::Indexed(key, value));
                }
                Token::Name(n) if self.peek_is_assign(n) => {
                    let name = n.clone();
                    self.advance()?;
                    self.advance()?;
                    let value = self.expr()?;
                    fields.push(TableField::Named(name, value));
                }
                _ => fields.push(TableField::Positional(self.expr()?)),
            }
            if !self.accept(&Token::Comma)? && !self.accept(&Token::Semi)? {
                break;
            }
        }
        self.expect(Token::RBrace)?;
        Ok(Expr::Table { fields, line })
    }

    /// `NAME = ...` inside a table constructor needs one token of lookahead
    /// past `NAME` to distinguish it from a positional expression that
    /// merely starts with a name (`f(x)`, `x.y`, ...). `current` is still on
    /// the name, so a cloned lexer can check whether `=` follows without
    /// disturbing the real one.
    fn peek_is_assign(&self, _name: &str) -> bool {
        let mut probe = self.lexer.clone();
        matches!(probe.next_token().map(|t| t.token), Ok(Token::Assign))
    }
}

const UNARY_PRECEDENCE: u8 = 12;

fn unary_op(tok: &Token) -> Option<UnOp> {
    match tok {
        Token::Minus => Some(UnOp::Neg),
        Token::Not => Some(UnOp::Not),
        Token::Hash => Some(UnOp::Len),
        Token::Tilde => Some(UnOp::BNot),
        _ => None,
    }
}

/// `(op, left binding power, right binding power)`. Right-associative
/// operators (`..`, `^`) bind the right side more loosely than the left.
fn binary_op(tok: &Token) -> Option<(BinOp, u8, u8)> {
    Some(match tok {
        Token::Or => (BinOp::Or, 1, 2),
        Token::And => (BinOp::And, 2, 3),
        Token::Lt => (BinOp::Lt, 3, 4),
        Token::Gt => (BinOp::Gt, 3, 4),
        Token::Le => (BinOp::Le, 3, 4),
        Token::Ge => (BinOp::Ge, 3, 4),
        Token::Ne => (BinOp::Ne, 3, 4),
        Token::Eq => (BinOp::Eq, 3, 4),
        Token::Pipe => (BinOp::BOr, 4, 5),
        Token::Tilde => (BinOp::BXor, 5, 6),
        Token::Amp => (BinOp::BAnd, 6, 7),
        Token::Shl => (BinOp::Shl, 7, 8),
        Token::Shr => (BinOp::Shr, 7, 8),
        Token::Concat => (BinOp::Concat, 9, 8), // right-assoc
        Token::Plus => (BinOp::Add, 10, 11),
        Token::Minus => (BinOp::Sub, 10, 11),
        Token::Star => (BinOp::Mul, 11, 12),
        Token::Slash => (BinOp::Div, 11, 12),
        Token::DSlash => (BinOp::IDiv, 11, 12),
        Token::Percent => (BinOp::Mod, 11, 12),
        Token::Caret => (BinOp::Pow, 14, 13), // right-assoc, binds tighter than unary
        _ => return None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(src: &str) -> FunctionBody {
        Parser::new(src.as_bytes(), "=test").unwrap().parse_chunk().unwrap()
    }

    #[test]
    fn parses_local_assignment() {
        let chunk = parse("local x = 1 + 2 * 3");
        assert_eq!(chunk.block.statements.len(), 1);
        assert!(matches!(chunk.block.statements[0], Stat::Local { .. }));
    }

    #[test]
    fn precedence_pow_and_concat_right_assoc() {
        let chunk = parse("return 2^3^2");
        match &chunk.block.statements[0] {
            Stat::Return { values, .. } => match &values[0] {
                Expr::Binary { op: BinOp::Pow, rhs, .. } => {
                    assert!(matches!(**rhs, Expr::Binary { op: BinOp::Pow, .. }));
                }
                _ => panic!("expected pow"),
            },
            _ => panic!("expected return"),
        }
    }

    #[test]
    fn numeric_for_with_step() {
        let chunk = parse("for i=1,10,2 do end");
        assert!(matches!(chunk.block.statements[0], Stat::NumericFor { .. }));
    }

    #[test]
    fn method_call_chain() {
        let chunk = parse("a:b():c()");
        assert!(matches!(chunk.block.statements[0], Stat::Call(Expr::MethodCall { .. })));
    }

    #[test]
    fn local_const_and_close_attributes() {
        let chunk = parse("local x <const> = 1; local y <close> = nil");
        match &chunk.block.statements[0] {
            Stat::Local { names, .. } => assert_eq!(names[0].1, VarAttrib::Const),
            _ => panic!(),
        }
    }
}
