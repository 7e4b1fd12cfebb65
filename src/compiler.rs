//! Single-pass compiler: tokens in, bytecode out
//!
//! Statements are parsed by recursive descent and expressions by
//! precedence climbing; both emit straight into the active function's
//! chunk. There is no AST. A stack of in-progress functions supports
//! nested declarations and a stack of loop frames collects the
//! break/continue jumps that get patched once a loop's start and end
//! addresses are known.
//!
//! Assignment is recognized after the fact: when `=` follows a
//! left-hand side that is exactly a bare identifier load, the
//! just-emitted `LoadVar` pair is rewritten in place into a `StoreVar`.
//! The check is deliberately total — correct opcode, exact two-byte
//! width, not a parenthesized group — and anything else is rejected.

use std::rc::Rc;

use lasso::Rodeo;

use crate::{
    chunk::{Chunk, OffsetError, Op},
    scanner::{ScanError, Scanner},
    token::{Token, TokenKind},
    value::{UserFn, Value},
};

#[derive(thiserror::Error, Debug)]
pub enum CompileError {
    #[error(transparent)]
    Scan(#[from] ScanError),
    #[error("line {0}: {1}", .found.line, .message)]
    Syntax {
        message: &'static str,
        found: Token,
    },
    #[error("line {}: unexpected token '{}'", .0.line, .0.text)]
    UnexpectedToken(Token),
    #[error("line {}: cannot 'break' when not in a loop", .0.line)]
    BreakOutsideLoop(Token),
    #[error("line {}: cannot 'continue' when not in a loop", .0.line)]
    ContinueOutsideLoop(Token),
    #[error("line {}: cannot 'return' when not inside a function", .0.line)]
    ReturnOutsideFunction(Token),
    #[error("line {}: can only assign values to an identifier, not an expression", .0.line)]
    InvalidAssignmentTarget(Token),
    #[error("line {}: unterminated block", .0.line)]
    UnterminatedBlock(Token),
    #[error("line {}: a jump is too large for its two-byte operand", .0.line)]
    JumpTooLarge(Token),
    #[error("internal compiler error: {0}")]
    Offset(#[from] OffsetError),
}

/// Patch lists for the loop currently being compiled. `function_depth`
/// pins the frame to the function it was opened in, so a
/// break/continue inside a nested function body is rejected instead of
/// patching the wrong chunk.
struct LoopFrame {
    function_depth: usize,
    breaks: Vec<usize>,
    continues: Vec<usize>,
}

enum BlockKind {
    /// `do ... end`
    Do,
    /// `does ... end`, for function bodies
    Does,
}

pub struct Compiler<'src, 'r> {
    scanner: Scanner<'src>,
    rodeo: &'r mut Rodeo,
    previous: Token,
    current: Token,
    functions: Vec<UserFn>,
    loops: Vec<LoopFrame>,
}

/// `(right_associative, precedence)` for every binary operator; higher
/// binds tighter. Subscript and assignment sit at the bottom, then
/// membership, the logical tier, relational, additive, multiplicative.
fn operator_info(kind: TokenKind) -> Option<(bool, u8)> {
    use TokenKind::*;
    let info = match kind {
        LeftBracket => (false, 0),
        Equal => (true, 0),
        In => (false, 1),
        Or | And => (false, 2),
        Less | LessEqual | Greater | GreaterEqual | EqualEqual => (false, 3),
        Plus | Minus => (false, 4),
        Star | Slash => (false, 5),
        _ => return None,
    };
    Some(info)
}

impl<'src, 'r> Compiler<'src, 'r> {
    pub fn new(scanner: Scanner<'src>, rodeo: &'r mut Rodeo) -> Self {
        Self {
            scanner,
            rodeo,
            previous: Token::eof(0, 1),
            current: Token::eof(0, 1),
            functions: Vec::new(),
            loops: Vec::new(),
        }
    }

    /// Compile the whole token stream into the root `main` function.
    pub fn compile(mut self) -> Result<UserFn, CompileError> {
        let main = self.rodeo.get_or_intern("main");
        self.functions.push(UserFn::new(main));

        self.advance()?;
        while !self.check(TokenKind::Eof) {
            self.declaration()?;
        }

        self.emit(Op::Null);
        self.emit(Op::Return);

        Ok(self
            .functions
            .pop()
            .expect("the root function is always on the stack"))
    }

    // ---- token plumbing ----

    fn advance(&mut self) -> Result<(), CompileError> {
        let next = self.scanner.scan_token()?;
        self.previous = std::mem::replace(&mut self.current, next);
        Ok(())
    }

    fn check(&self, kind: TokenKind) -> bool {
        self.current.kind == kind
    }

    fn matches(&mut self, kind: TokenKind) -> Result<bool, CompileError> {
        if !self.check(kind) {
            return Ok(false);
        }
        self.advance()?;
        Ok(true)
    }

    fn consume(&mut self, kind: TokenKind, message: &'static str) -> Result<(), CompileError> {
        if !self.check(kind) {
            return Err(CompileError::Syntax {
                message,
                found: self.current.clone(),
            });
        }
        self.advance()
    }

    // ---- emission ----

    fn function_mut(&mut self) -> &mut UserFn {
        self.functions
            .last_mut()
            .expect("the function stack is never empty while compiling")
    }

    fn chunk_mut(&mut self) -> &mut Chunk {
        &mut self.function_mut().chunk
    }

    fn chunk_len(&self) -> usize {
        self.functions
            .last()
            .expect("the function stack is never empty while compiling")
            .chunk
            .len()
    }

    fn emit(&mut self, op: Op) {
        self.emit_byte(op as u8);
    }

    fn emit_byte(&mut self, byte: u8) {
        let line = self.current.line;
        self.chunk_mut().write(byte, line);
    }

    /// Emit a jump with a placeholder operand; returns the operand's
    /// offset for patching.
    fn emit_jump(&mut self, op: Op) -> usize {
        self.emit(op);
        self.emit_byte(0);
        self.emit_byte(0);
        self.chunk_len() - 2
    }

    /// Point the jump operand at `offset` to the current end of code.
    fn patch_jump(&mut self, offset: usize) -> Result<(), CompileError> {
        let distance = self.chunk_len() - offset - 2;
        if distance > u16::MAX as usize {
            return Err(CompileError::JumpTooLarge(self.current.clone()));
        }
        self.chunk_mut().patch(offset, (distance >> 8) as u8)?;
        self.chunk_mut().patch(offset + 1, (distance & 0xff) as u8)?;
        Ok(())
    }

    /// Emit a backward jump to `loop_start`.
    fn emit_loop(&mut self, loop_start: usize) -> Result<(), CompileError> {
        self.emit(Op::Loop);
        let distance = self.chunk_len() - loop_start + 2;
        if distance > u16::MAX as usize {
            return Err(CompileError::JumpTooLarge(self.current.clone()));
        }
        self.emit_byte((distance >> 8) as u8);
        self.emit_byte((distance & 0xff) as u8);
        Ok(())
    }

    /// Add a constant, failing if the pool outgrows the one-byte
    /// operand.
    fn constant_index(&mut self, value: Value) -> Result<u8, CompileError> {
        let index = self.chunk_mut().add_constant(value);
        u8::try_from(index).map_err(|_| CompileError::Syntax {
            message: "Too many constants in one function.",
            found: self.current.clone(),
        })
    }

    /// Constant-pool index of the identifier in `previous`.
    fn identifier_constant(&mut self) -> Result<u8, CompileError> {
        let name = self.rodeo.get_or_intern(&*self.previous.text);
        self.constant_index(Value::String(name))
    }

    // ---- declarations and statements ----

    fn declaration(&mut self) -> Result<(), CompileError> {
        if self.matches(TokenKind::Function)? {
            self.function_declaration()
        } else if self.matches(TokenKind::Eol)? {
            // empty line
            Ok(())
        } else {
            self.statement()
        }
    }

    fn statement(&mut self) -> Result<(), CompileError> {
        if self.matches(TokenKind::If)? {
            self.if_statement()
        } else if self.matches(TokenKind::For)? {
            self.for_statement()
        } else if self.matches(TokenKind::While)? {
            self.while_statement()
        } else if self.matches(TokenKind::Return)? {
            self.return_statement()
        } else if self.matches(TokenKind::Continue)? {
            let keyword = self.previous.clone();
            let jump = self.emit_jump(Op::Jump);
            self.innermost_loop()
                .ok_or(CompileError::ContinueOutsideLoop(keyword))?
                .continues
                .push(jump);
            Ok(())
        } else if self.matches(TokenKind::Break)? {
            let keyword = self.previous.clone();
            let jump = self.emit_jump(Op::Jump);
            self.innermost_loop()
                .ok_or(CompileError::BreakOutsideLoop(keyword))?
                .breaks
                .push(jump);
            Ok(())
        } else if self.check(TokenKind::Do) {
            self.emit(Op::BeginScope);
            self.block(BlockKind::Do)?;
            self.emit(Op::EndScope);
            Ok(())
        } else {
            self.expression_statement()
        }
    }

    /// The innermost loop frame, provided it belongs to the function
    /// currently being compiled.
    fn innermost_loop(&mut self) -> Option<&mut LoopFrame> {
        let depth = self.functions.len();
        self.loops
            .last_mut()
            .filter(|frame| frame.function_depth == depth)
    }

    fn expression_statement(&mut self) -> Result<(), CompileError> {
        self.expression(0)?;
        self.emit(Op::Pop);
        self.consume(TokenKind::Eol, "Expect expression to be terminated.")
    }

    fn block(&mut self, kind: BlockKind) -> Result<(), CompileError> {
        match kind {
            BlockKind::Do => self.consume(TokenKind::Do, "Expect 'do' to open the block.")?,
            BlockKind::Does => {
                self.consume(TokenKind::Does, "Expect 'does' to open the function body.")?
            }
        }
        self.consume(TokenKind::Eol, "Expect end of line after block start.")?;

        while !self.check(TokenKind::End) && !self.check(TokenKind::Eof) {
            self.declaration()?;
        }

        if !self.matches(TokenKind::End)? {
            return Err(CompileError::UnterminatedBlock(self.current.clone()));
        }
        self.consume(TokenKind::Eol, "Expect end of line after 'end'.")
    }

    /// Each arm: condition, conditional jump over the body, body,
    /// jump-to-end. Every false edge pops the tested condition, and
    /// every arm's end jump is patched to the instruction after the
    /// whole chain, so exactly one branch runs.
    fn if_statement(&mut self) -> Result<(), CompileError> {
        let mut end_jumps = Vec::new();
        loop {
            self.expression(0)?;
            let false_jump = self.emit_jump(Op::JumpIfFalse);
            self.emit(Op::Pop);

            self.emit(Op::BeginScope);
            self.block(BlockKind::Do)?;
            self.emit(Op::EndScope);

            end_jumps.push(self.emit_jump(Op::Jump));
            self.patch_jump(false_jump)?;
            self.emit(Op::Pop);

            if !self.matches(TokenKind::Elif)? {
                break;
            }
        }

        if self.matches(TokenKind::Else)? {
            self.emit(Op::BeginScope);
            self.block(BlockKind::Do)?;
            self.emit(Op::EndScope);
        }

        for jump in end_jumps {
            self.patch_jump(jump)?;
        }
        Ok(())
    }

    /// The condition is re-evaluated each iteration via a backward
    /// loop jump. Continues land on the re-test, breaks after the
    /// exit's condition pop. One scope spans the whole loop.
    fn while_statement(&mut self) -> Result<(), CompileError> {
        self.emit(Op::BeginScope);
        let loop_start = self.chunk_len();
        self.loops.push(LoopFrame {
            function_depth: self.functions.len(),
            breaks: Vec::new(),
            continues: Vec::new(),
        });

        self.expression(0)?;
        let exit_jump = self.emit_jump(Op::JumpIfFalse);
        self.emit(Op::Pop);

        self.block(BlockKind::Do)?;

        let frame = self.loops.pop().expect("the while loop pushed a frame");
        for jump in frame.continues {
            self.patch_jump(jump)?;
        }
        self.emit_loop(loop_start)?;
        self.patch_jump(exit_jump)?;
        self.emit(Op::Pop);
        for jump in frame.breaks {
            self.patch_jump(jump)?;
        }

        self.emit(Op::EndScope);
        Ok(())
    }

    /// Desugars into: evaluate the iterable, wrap it in an iterator,
    /// then loop advance-or-exit / bind / body / jump back. The
    /// iterator rides the operand stack for the loop's lifetime.
    fn for_statement(&mut self) -> Result<(), CompileError> {
        self.emit(Op::BeginScope);

        self.consume(TokenKind::Identifier, "Expect identifier as looping variable.")?;
        let variable = self.identifier_constant()?;
        self.consume(TokenKind::In, "Expect 'in' after the looping variable.")?;

        self.expression(0)?;
        self.emit(Op::CreateIterator);

        let loop_start = self.chunk_len();
        let exit_jump = self.emit_jump(Op::ForwardIterator);
        self.loops.push(LoopFrame {
            function_depth: self.functions.len(),
            breaks: Vec::new(),
            continues: Vec::new(),
        });

        self.emit(Op::StoreVar);
        self.emit_byte(variable);
        self.emit(Op::Pop);

        self.block(BlockKind::Do)?;

        let frame = self.loops.pop().expect("the for loop pushed a frame");
        for jump in frame.continues {
            self.patch_jump(jump)?;
        }
        self.emit_loop(loop_start)?;
        self.patch_jump(exit_jump)?;
        // exhaustion and break both land here, dropping the iterator
        for jump in frame.breaks {
            self.patch_jump(jump)?;
        }
        self.emit(Op::Pop);

        self.emit(Op::EndScope);
        Ok(())
    }

    fn return_statement(&mut self) -> Result<(), CompileError> {
        if self.functions.len() == 1 {
            return Err(CompileError::ReturnOutsideFunction(self.previous.clone()));
        }

        if self.matches(TokenKind::Eol)? || self.check(TokenKind::Eof) {
            self.emit(Op::Null);
            self.emit(Op::Return);
            return Ok(());
        }

        self.expression(0)?;
        self.consume(TokenKind::Eol, "Expect only an expression after 'return'.")?;
        self.emit(Op::Return);
        Ok(())
    }

    /// Compile a nested function into its own chunk, then reference
    /// the finished function as a constant of the enclosing chunk. The
    /// binding itself happens when `DefFunction` executes, so functions
    /// are values created at the point of declaration execution.
    fn function_declaration(&mut self) -> Result<(), CompileError> {
        self.consume(TokenKind::Identifier, "Expect function name after 'function'.")?;
        let name = self.rodeo.get_or_intern(&*self.previous.text);
        self.functions.push(UserFn::new(name));

        self.consume(TokenKind::LeftParen, "Expect '(' after function declaration.")?;
        let mut parameters = Vec::new();
        if !self.check(TokenKind::RightParen) {
            loop {
                self.consume(TokenKind::Identifier, "Expect parameter name.")?;
                parameters.push(self.identifier_constant()?);
                if !self.matches(TokenKind::Comma)? {
                    break;
                }
            }
        }
        self.function_mut().arity = parameters.len();
        self.consume(TokenKind::RightParen, "Expect ')' after parameters.")?;

        // the caller pushed arguments left to right, so the last
        // parameter's value is on top: bind in reverse, dropping each
        // re-pushed value
        for parameter in parameters.iter().rev() {
            self.emit(Op::StoreVar);
            self.emit_byte(*parameter);
            self.emit(Op::Pop);
        }

        self.block(BlockKind::Does)?;

        // safety net for bodies without a return
        self.emit(Op::Null);
        self.emit(Op::Return);

        let finished = self
            .functions
            .pop()
            .expect("the function declaration pushed a context");
        let index = self.constant_index(Value::Function(Rc::new(finished)))?;
        self.emit(Op::DefFunction);
        self.emit_byte(index);
        Ok(())
    }

    // ---- expressions ----

    /// Precedence climbing. `min_precedence` 0 admits every operator,
    /// including assignment.
    fn expression(&mut self, min_precedence: u8) -> Result<(), CompileError> {
        let lhs_offset = self.chunk_len();
        self.atom()?;
        let grouping = self.previous.kind == TokenKind::RightParen;

        while let Some((right_associative, precedence)) = operator_info(self.current.kind) {
            if precedence < min_precedence {
                break;
            }
            let operator = self.current.clone();
            let next_min = if right_associative {
                precedence
            } else {
                precedence + 1
            };
            self.advance()?;

            match operator.kind {
                TokenKind::Equal => self.assignment(&operator, grouping, lhs_offset, next_min)?,
                TokenKind::LeftBracket => self.subscript(next_min)?,
                _ => {
                    self.expression(next_min)?;
                    self.binary_operator(&operator)?;
                }
            }
        }
        Ok(())
    }

    fn atom(&mut self) -> Result<(), CompileError> {
        if self.matches(TokenKind::LeftParen)? {
            self.expression(0)?;
            self.consume(TokenKind::RightParen, "All groupings must be closed off.")
        } else if self.matches(TokenKind::Minus)? {
            self.atom()?;
            self.emit(Op::Negate);
            Ok(())
        } else if self.matches(TokenKind::Not)? {
            self.atom()?;
            self.emit(Op::Not);
            Ok(())
        } else if self.matches(TokenKind::True)? {
            self.emit(Op::True);
            Ok(())
        } else if self.matches(TokenKind::False)? {
            self.emit(Op::False);
            Ok(())
        } else if self.matches(TokenKind::Null)? {
            self.emit(Op::Null);
            Ok(())
        } else if self.matches(TokenKind::Number)? {
            self.number_literal()
        } else if self.matches(TokenKind::String)? {
            self.string_literal()
        } else if self.matches(TokenKind::Identifier)? {
            self.identifier_expression()
        } else if self.matches(TokenKind::LeftBracket)? {
            self.list_literal()
        } else {
            Err(CompileError::UnexpectedToken(self.current.clone()))
        }
    }

    fn number_literal(&mut self) -> Result<(), CompileError> {
        let number: f64 = self.previous.text.parse().map_err(|_| CompileError::Syntax {
            message: "Expect a numeric literal.",
            found: self.previous.clone(),
        })?;
        let index = self.constant_index(Value::Number(number))?;
        self.emit(Op::LoadConstant);
        self.emit_byte(index);
        Ok(())
    }

    fn string_literal(&mut self) -> Result<(), CompileError> {
        let text = self.rodeo.get_or_intern(&*self.previous.text);
        let index = self.constant_index(Value::String(text))?;
        self.emit(Op::LoadConstant);
        self.emit_byte(index);
        Ok(())
    }

    /// A bare identifier loads; an identifier followed by `(` is a
    /// call.
    fn identifier_expression(&mut self) -> Result<(), CompileError> {
        let index = self.identifier_constant()?;
        if self.check(TokenKind::LeftParen) {
            self.call(index)
        } else {
            self.emit(Op::LoadVar);
            self.emit_byte(index);
            Ok(())
        }
    }

    /// Arguments compile left to right, then the callee is pushed and
    /// `Call argc` dispatches.
    fn call(&mut self, callee: u8) -> Result<(), CompileError> {
        self.consume(TokenKind::LeftParen, "Expect '(' after function identifier.")?;
        let mut argument_count = 0usize;
        if !self.check(TokenKind::RightParen) {
            loop {
                self.expression(0)?;
                argument_count += 1;
                if !self.matches(TokenKind::Comma)? {
                    break;
                }
            }
        }
        self.consume(TokenKind::RightParen, "Expect ')' after function call.")?;

        if argument_count > u8::MAX as usize {
            return Err(CompileError::Syntax {
                message: "Too many arguments in one call.",
                found: self.current.clone(),
            });
        }

        self.emit(Op::LoadVar);
        self.emit_byte(callee);
        self.emit(Op::Call);
        self.emit_byte(argument_count as u8);
        Ok(())
    }

    /// `[]`, `[a, b, c]`, `[start..end]`, or `[start..end:step]`. The
    /// no-step range form pushes a null placeholder; the VM infers the
    /// direction from the bounds.
    fn list_literal(&mut self) -> Result<(), CompileError> {
        if self.matches(TokenKind::RightBracket)? {
            self.emit(Op::CreateListFromValues);
            self.emit_byte(0);
            return Ok(());
        }

        self.expression(0)?;

        if self.matches(TokenKind::DoubleDot)? {
            self.expression(0)?;
            if self.matches(TokenKind::Colon)? {
                self.expression(0)?;
            } else {
                self.emit(Op::Null);
            }
            self.consume(TokenKind::RightBracket, "Expect ']' after range definition.")?;
            self.emit(Op::CreateListFromRange);
            return Ok(());
        }

        let mut item_count = 1usize;
        while self.matches(TokenKind::Comma)? {
            self.expression(0)?;
            item_count += 1;
        }
        self.consume(TokenKind::RightBracket, "Expect ']' after list items.")?;

        if item_count > u8::MAX as usize {
            return Err(CompileError::Syntax {
                message: "Too many items in one list literal.",
                found: self.current.clone(),
            });
        }
        self.emit(Op::CreateListFromValues);
        self.emit_byte(item_count as u8);
        Ok(())
    }

    /// Rewrite the just-emitted identifier load into a store. Fails
    /// closed unless the left-hand side was exactly `LoadVar idx` and
    /// not a grouping.
    fn assignment(
        &mut self,
        operator: &Token,
        grouping: bool,
        lhs_offset: usize,
        min_precedence: u8,
    ) -> Result<(), CompileError> {
        let is_bare_load = self.chunk_len() == lhs_offset + 2
            && self.functions
                .last()
                .expect("the function stack is never empty while compiling")
                .chunk
                .byte(lhs_offset)
                == Some(Op::LoadVar as u8);
        if !is_bare_load || grouping {
            return Err(CompileError::InvalidAssignmentTarget(operator.clone()));
        }

        self.chunk_mut().remove(lhs_offset)?;
        let index = self.chunk_mut().remove(lhs_offset)?;

        self.expression(min_precedence)?;

        self.emit(Op::StoreVar);
        self.emit_byte(index);
        Ok(())
    }

    /// Index-then-store or index-then-load, depending on whether an
    /// `=` follows the closing bracket.
    fn subscript(&mut self, min_precedence: u8) -> Result<(), CompileError> {
        self.expression(min_precedence)?;
        self.consume(TokenKind::RightBracket, "Expect ']' after subscript.")?;
        if self.matches(TokenKind::Equal)? {
            self.expression(0)?;
            self.emit(Op::StoreSubscript);
        } else {
            self.emit(Op::GetSubscript);
        }
        Ok(())
    }

    fn binary_operator(&mut self, operator: &Token) -> Result<(), CompileError> {
        match operator.kind {
            TokenKind::Plus => self.emit(Op::Add),
            TokenKind::Minus => self.emit(Op::Subtract),
            TokenKind::Star => self.emit(Op::Multiply),
            TokenKind::Slash => self.emit(Op::Divide),
            TokenKind::And => self.emit(Op::And),
            TokenKind::Or => self.emit(Op::Or),
            TokenKind::EqualEqual => self.emit(Op::Equal),
            TokenKind::Greater => self.emit(Op::Greater),
            TokenKind::Less => self.emit(Op::Less),
            TokenKind::GreaterEqual => {
                self.emit(Op::Less);
                self.emit(Op::Not);
            }
            TokenKind::LessEqual => {
                self.emit(Op::Greater);
                self.emit(Op::Not);
            }
            TokenKind::In => self.emit(Op::In),
            _ => return Err(CompileError::UnexpectedToken(operator.clone())),
        }
        Ok(())
    }
}
