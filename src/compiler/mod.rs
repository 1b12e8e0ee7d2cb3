//! AST-to-bytecode lowering (§4.4), grounded on the teacher's single-pass
//! `IrGen`-to-`Instruction` assembler: one visit over the tree, emitting
//! directly into a [`Builder`] rather than building an intermediate IR.

mod scope;

use crate::ast::{BinOp, Block, Expr, FunctionBody, LValue, Stmt, TableField, UnOp};
use crate::bytecode::{Builder, CaptureType, Module, Opcode};
use crate::error::{CompileError, CompileResult};
use crate::source::SourceSpan;
use scope::{FuncState, LoopContext, UpvalDesc, UpvalSource, VarLoc};
use std::rc::Rc;

/// Drives a [`Builder`] from an AST, keeping one [`FuncState`] per function
/// currently being lowered, mirroring the builder's own `begin_function` /
/// `end_function` nesting.
pub struct Compiler {
    builder: Builder,
    funcs: Vec<FuncState>,
}

/// Lower a parsed chunk into a finished [`Module`] (§4.4 "Entry point").
pub fn compile(chunk: &Block) -> CompileResult<Module> {
    let mut c = Compiler {
        builder: Builder::new(),
        funcs: Vec::new(),
    };
    c.builder.begin_function(0, true);
    c.funcs.push(FuncState::new());
    c.compile_block(chunk)?;
    c.compile_return(&[])?;
    let func = c.funcs.pop().expect("main function state");
    let max_stack = func.max_stack_size();
    let id = c.builder.end_function(max_stack, 0)?;
    c.builder.set_main_function(id);
    Ok(c.builder.finish())
}

impl Compiler {
    fn cur(&mut self) -> &mut FuncState {
        self.funcs.last_mut().expect("no function is being compiled")
    }

    fn resolve_name(&mut self, name: &str) -> CompileResult<VarLoc> {
        let level = self.funcs.len() - 1;
        scope::resolve(&mut self.funcs, level, name)
    }

    fn err_outside_loop(what: &str) -> CompileError {
        CompileError::MalformedDeclaration {
            message: format!("{what} used outside a loop"),
            span: SourceSpan::default(),
        }
    }

    // -- Functions ------------------------------------------------------

    fn compile_function(
        &mut self,
        body: &FunctionBody,
        debug_name: Option<Rc<str>>,
    ) -> CompileResult<(u32, Vec<UpvalDesc>)> {
        self.builder.begin_function(body.params.len() as u8, body.is_vararg);
        self.funcs.push(FuncState::new());

        if let Some(name) = debug_name.or_else(|| body.debug_name.clone()) {
            self.builder.set_debug_function_name(name);
        }

        for param in &body.params {
            self.cur().declare_local(Rc::clone(param))?;
        }

        self.compile_block(&body.body)?;
        self.compile_return(&[])?;

        let func = self.funcs.pop().expect("function state pushed above");
        let max_stack = func.max_stack_size();
        let num_upvalues = func.upvalues.len() as u8;
        for up in &func.upvalues {
            self.builder.push_debug_upvalue(Rc::clone(&up.name));
        }
        let id = self.builder.end_function(max_stack, num_upvalues)?;
        Ok((id, func.upvalues))
    }

    fn emit_new_closure(&mut self, child_id: u32, upvalues: &[UpvalDesc], dest: u8) -> CompileResult<()> {
        let child_idx = self.builder.add_child(child_id)?;
        let pc = self.builder.emit_ad(Opcode::NewClosure, dest, 0);
        self.builder.emit_aux(child_idx);
        let mut types = Vec::with_capacity(upvalues.len());
        for up in upvalues {
            let source_reg = match up.source {
                UpvalSource::ParentLocal(r) => r,
                UpvalSource::ParentUpvalue(i) => i,
            };
            let tag = match up.capture_type {
                CaptureType::Value => 0,
                CaptureType::Reference => 1,
                CaptureType::Upvalue => 2,
            };
            self.builder.emit_abc(Opcode::Capture, tag, source_reg, 0);
            types.push(up.capture_type);
        }
        self.builder.record_capture_types(pc, types.clone());
        self.builder.set_capture_types(child_id, types);
        Ok(())
    }

    // -- Blocks and statements -------------------------------------------

    fn compile_block(&mut self, block: &Block) -> CompileResult<()> {
        self.cur().push_scope();
        for stmt in &block.stmts {
            self.compile_stmt(stmt)?;
        }
        let (floor, captured) = self.cur().pop_scope();
        if captured {
            self.builder.emit_abc(Opcode::CloseUpvalues, floor, 0, 0);
        }
        Ok(())
    }

    fn compile_stmt(&mut self, stmt: &Stmt) -> CompileResult<()> {
        match stmt {
            Stmt::Block(b) => self.compile_block(b)?,
            Stmt::If { arms, else_block } => self.compile_if(arms, else_block)?,
            Stmt::While { cond, body, .. } => self.compile_while(cond, body)?,
            Stmt::Repeat { body, cond, .. } => self.compile_repeat(body, cond)?,
            Stmt::NumericFor {
                var, start, stop, step, body, ..
            } => self.compile_numeric_for(var, start, stop, step.as_ref(), body)?,
            Stmt::GenericFor { vars, exprs, body, .. } => self.compile_generic_for(vars, exprs, body)?,
            Stmt::Break => self.compile_break()?,
            Stmt::Continue => self.compile_continue()?,
            Stmt::Return(exprs) => self.compile_return(exprs)?,
            Stmt::ExprStmt(e) => self.compile_expr_stmt(e)?,
            Stmt::LocalDecl { names, values } => self.compile_local_decl(names, values)?,
            Stmt::Assign { targets, values } => self.compile_assign(targets, values)?,
            Stmt::CompoundAssign { target, op, value } => self.compile_compound_assign(target, op, value)?,
            Stmt::FunctionDecl { target, body } => {
                let debug_name = lvalue_debug_name(target);
                let (child_id, upvalues) = self.compile_function(body, debug_name)?;
                let mark = self.cur().register_top();
                let reg = self.cur().alloc_register()?;
                self.emit_new_closure(child_id, &upvalues, reg)?;
                self.store_lvalue(target, reg)?;
                self.cur().free_to(mark);
            }
            Stmt::LocalFunctionDecl { name, body } => {
                let reg = self.cur().declare_local(Rc::clone(name))?;
                let (child_id, upvalues) = self.compile_function(body, Some(Rc::clone(name)))?;
                self.emit_new_closure(child_id, &upvalues, reg)?;
            }
            Stmt::TypeAlias { .. }
            | Stmt::DeclareGlobal { .. }
            | Stmt::DeclareFunction { .. }
            | Stmt::DeclareClass { .. } => {
                // Type-level declarations only; parsed but not enforced or
                // executed (§4.2 "Type annotations are parsed but not
                // enforced").
            }
            Stmt::Error(_) => {}
        }
        Ok(())
    }

    fn compile_if(&mut self, arms: &[(Expr, Block, SourceSpan)], else_block: &Option<Block>) -> CompileResult<()> {
        let mut end_jumps = Vec::with_capacity(arms.len());
        let mut prev_false_jump: Option<u32> = None;
        for (cond, body, _) in arms {
            if let Some(jump) = prev_false_jump.take() {
                let here = self.builder.current_pc();
                self.builder.patch_jump_d(jump, here)?;
            }
            let mark = self.cur().register_top();
            let cond_reg = self.compile_expr(cond)?;
            let false_jump = self.builder.emit_ad(Opcode::JumpIfNot, cond_reg, 0);
            self.cur().free_to(mark);
            self.compile_block(body)?;
            end_jumps.push(self.builder.emit_ad(Opcode::Jump, 0, 0));
            prev_false_jump = Some(false_jump);
        }
        if let Some(jump) = prev_false_jump.take() {
            let here = self.builder.current_pc();
            self.builder.patch_jump_d(jump, here)?;
        }
        if let Some(else_body) = else_block {
            self.compile_block(else_body)?;
        }
        let end_pc = self.builder.current_pc();
        for jump in end_jumps {
            self.builder.patch_jump_d(jump, end_pc)?;
        }
        Ok(())
    }

    fn compile_while(&mut self, cond: &Expr, body: &Block) -> CompileResult<()> {
        let loop_start = self.builder.current_pc();
        let mark = self.cur().register_top();
        let cond_reg = self.compile_expr(cond)?;
        let exit_jump = self.builder.emit_ad(Opcode::JumpIfNot, cond_reg, 0);
        self.cur().free_to(mark);

        self.cur().loops.push(LoopContext {
            break_jumps: Vec::new(),
            continue_jumps: Vec::new(),
            register_floor: self.cur().register_top(),
        });
        self.compile_block(body)?;
        let loop_ctx = self.cur().loops.pop().expect("loop context pushed above");
        let epilogue_pc = self.builder.current_pc();
        for cj in &loop_ctx.continue_jumps {
            self.builder.patch_jump_d(*cj, epilogue_pc)?;
        }
        let back_pc = self.builder.emit_ad(Opcode::JumpBack, 0, 0);
        self.builder.patch_jump_d(back_pc, loop_start)?;

        let after_loop = self.builder.current_pc();
        self.builder.patch_jump_d(exit_jump, after_loop)?;
        for bj in &loop_ctx.break_jumps {
            self.builder.patch_jump_d(*bj, after_loop)?;
        }
        Ok(())
    }

    fn compile_repeat(&mut self, body: &Block, cond: &Expr) -> CompileResult<()> {
        let loop_start = self.builder.current_pc();
        self.cur().push_scope();
        self.cur().loops.push(LoopContext {
            break_jumps: Vec::new(),
            continue_jumps: Vec::new(),
            register_floor: self.cur().register_top(),
        });
        for stmt in &body.stmts {
            self.compile_stmt(stmt)?;
        }
        let loop_ctx = self.cur().loops.pop().expect("loop context pushed above");
        let epilogue_pc = self.builder.current_pc();
        for cj in &loop_ctx.continue_jumps {
            self.builder.patch_jump_d(*cj, epilogue_pc)?;
        }

        let mark = self.cur().register_top();
        let cond_reg = self.compile_expr(cond)?;
        let (floor, captured) = self.cur().current_scope_capture_info();
        if captured {
            self.builder.emit_abc(Opcode::CloseUpvalues, floor, 0, 0);
        }
        let back_pc = self.builder.emit_ad(Opcode::JumpIfNot, cond_reg, 0);
        self.builder.patch_jump_d(back_pc, loop_start)?;
        self.cur().free_to(mark);
        self.cur().pop_scope();

        let after_loop = self.builder.current_pc();
        for bj in &loop_ctx.break_jumps {
            self.builder.patch_jump_d(*bj, after_loop)?;
        }
        Ok(())
    }

    fn compile_numeric_for(
        &mut self,
        var: &Rc<str>,
        start: &Expr,
        stop: &Expr,
        step: Option<&Expr>,
        body: &Block,
    ) -> CompileResult<()> {
        self.cur().push_scope();
        let base = self.cur().alloc_register()?;
        self.compile_expr_to(start, base)?;
        let limit_reg = self.cur().alloc_register()?;
        self.compile_expr_to(stop, limit_reg)?;
        let step_reg = self.cur().alloc_register()?;
        match step {
            Some(e) => self.compile_expr_to(e, step_reg)?,
            None => {
                let idx = self.builder.add_constant_number(1.0)?;
                self.emit_load_number(step_reg, idx)?;
            }
        }
        self.cur().declare_local(Rc::clone(var))?;

        let prepare_pc = self.builder.emit_ad(Opcode::ForNumericLoopPrepare, base, 0);
        let body_start = self.builder.current_pc();
        self.cur().loops.push(LoopContext {
            break_jumps: Vec::new(),
            continue_jumps: Vec::new(),
            register_floor: self.cur().register_top(),
        });
        self.compile_block(body)?;
        let loop_ctx = self.cur().loops.pop().expect("loop context pushed above");
        let epilogue_pc = self.builder.current_pc();
        for cj in &loop_ctx.continue_jumps {
            self.builder.patch_jump_d(*cj, epilogue_pc)?;
        }
        let back_pc = self.builder.emit_ad(Opcode::ForNumericLoop, base, 0);
        self.builder.patch_jump_d(back_pc, body_start)?;

        let after_loop = self.builder.current_pc();
        self.builder.patch_jump_d(prepare_pc, after_loop)?;
        for bj in &loop_ctx.break_jumps {
            self.builder.patch_jump_d(*bj, after_loop)?;
        }

        let (_, captured) = self.cur().pop_scope();
        if captured {
            self.builder.emit_abc(Opcode::CloseUpvalues, base, 0, 0);
        }
        Ok(())
    }

    /// Recognize a single-expression `pairs(t)`/`ipairs(t)` iterator call
    /// (§4.4 "for ... in" fast path). Returns the callee's name and the
    /// table argument expression. Anything else (a method call, an
    /// explicit `f, s, c` triple, a call with zero or more-than-one
    /// argument) falls back to the general lowering.
    fn recognize_stateless_iterator(exprs: &[Expr]) -> Option<(&str, &Expr)> {
        let [Expr::Call { callee, args, method: None }] = exprs else {
            return None;
        };
        let Expr::Global(name) = callee.as_ref() else {
            return None;
        };
        if name.as_ref() != "pairs" && name.as_ref() != "ipairs" {
            return None;
        }
        let [table_expr] = args.as_slice() else {
            return None;
        };
        Some((name.as_ref(), table_expr))
    }

    /// Generic `for vars in exprs do ... end`. A recognized `pairs(t)`/
    /// `ipairs(t)` call with at most two loop variables lowers to the
    /// dedicated `for_generator_loop*` opcodes; everything else falls back
    /// to a plain `call` to the iterator function each iteration.
    fn compile_generic_for(&mut self, vars: &[Rc<str>], exprs: &[Expr], body: &Block) -> CompileResult<()> {
        if vars.len() <= 2 {
            if let Some((name, table_expr)) = Self::recognize_stateless_iterator(exprs) {
                let prepare_op = if name == "ipairs" {
                    Opcode::ForGeneratorLoopPrepareInext
                } else {
                    Opcode::ForGeneratorLoopPrepareNext
                };
                return self.compile_generic_for_fast(prepare_op, table_expr, vars, body);
            }
        }
        self.compile_generic_for_general(vars, exprs, body)
    }

    /// Fast path for a recognized `pairs`/`ipairs` call: register window
    /// `A` (table/state), `A+1` (key/control), `A+2` (reserved, unused),
    /// `A+3` and (if present) `A+4` hold the loop variables, mirroring
    /// `compile_numeric_for`'s prepare/loop opcode pairing.
    fn compile_generic_for_fast(
        &mut self,
        prepare_op: Opcode,
        table_expr: &Expr,
        vars: &[Rc<str>],
        body: &Block,
    ) -> CompileResult<()> {
        self.cur().push_scope();
        let state_reg = self.cur().alloc_register()?;
        self.compile_expr_to(table_expr, state_reg)?;
        let control_reg = self.cur().alloc_register()?;
        self.builder.emit_abc(Opcode::LoadNull, control_reg, 0, 0);
        let extra_reg = self.cur().alloc_register()?;
        self.builder.emit_abc(Opcode::LoadNull, extra_reg, 0, 0);
        let key_reg = self.cur().alloc_register()?;
        self.cur().bind_existing_local(Rc::clone(&vars[0]), key_reg);
        // Always reserve the value slot (A+4), even with a single loop
        // variable: the dispatch handler writes it unconditionally.
        let value_reg = self.cur().alloc_register()?;
        if let Some(value_name) = vars.get(1) {
            self.cur().bind_existing_local(Rc::clone(value_name), value_reg);
        }

        let prepare_pc = self.builder.emit_ad(prepare_op, state_reg, 0);
        let body_start = self.builder.current_pc();
        self.cur().loops.push(LoopContext {
            break_jumps: Vec::new(),
            continue_jumps: Vec::new(),
            register_floor: self.cur().register_top(),
        });
        self.compile_block(body)?;
        let loop_ctx = self.cur().loops.pop().expect("loop context pushed above");
        let epilogue_pc = self.builder.current_pc();
        for cj in &loop_ctx.continue_jumps {
            self.builder.patch_jump_d(*cj, epilogue_pc)?;
        }
        let back_pc = self.builder.emit_ad(Opcode::ForGeneratorLoop, state_reg, 0);
        self.builder.patch_jump_d(back_pc, body_start)?;

        let after_loop = self.builder.current_pc();
        self.builder.patch_jump_d(prepare_pc, after_loop)?;
        for bj in &loop_ctx.break_jumps {
            self.builder.patch_jump_d(*bj, after_loop)?;
        }

        let (_, captured) = self.cur().pop_scope();
        if captured {
            self.builder.emit_abc(Opcode::CloseUpvalues, state_reg, 0, 0);
        }
        Ok(())
    }

    fn compile_generic_for_general(&mut self, vars: &[Rc<str>], exprs: &[Expr], body: &Block) -> CompileResult<()> {
        self.cur().push_scope();
        let iter_reg = self.cur().alloc_register()?;
        self.compile_expr_opt_to(exprs.first(), iter_reg)?;
        let state_reg = self.cur().alloc_register()?;
        self.compile_expr_opt_to(exprs.get(1), state_reg)?;
        let control_reg = self.cur().alloc_register()?;
        self.compile_expr_opt_to(exprs.get(2), control_reg)?;
        for extra in exprs.iter().skip(3) {
            let mark = self.cur().register_top();
            self.compile_expr(extra)?;
            self.cur().free_to(mark);
        }

        let loop_start = self.builder.current_pc();
        let call_base = self.cur().register_top();
        let result_slots = (vars.len() as u8).max(3);
        for _ in 0..result_slots {
            self.cur().alloc_register()?;
        }
        self.builder.emit_abc(Opcode::Move, call_base, iter_reg, 0);
        self.builder.emit_abc(Opcode::Move, call_base + 1, state_reg, 0);
        self.builder.emit_abc(Opcode::Move, call_base + 2, control_reg, 0);
        self.builder
            .emit_abc(Opcode::Call, call_base, 3, (vars.len() + 1) as u8);
        let exit_jump = self.builder.emit_ad(Opcode::JumpIfNot, call_base, 0);
        self.builder.emit_abc(Opcode::Move, control_reg, call_base, 0);
        for (i, name) in vars.iter().enumerate() {
            self.cur().bind_existing_local(Rc::clone(name), call_base + i as u8);
        }

        self.cur().loops.push(LoopContext {
            break_jumps: Vec::new(),
            continue_jumps: Vec::new(),
            register_floor: self.cur().register_top(),
        });
        self.compile_block(body)?;
        let loop_ctx = self.cur().loops.pop().expect("loop context pushed above");
        let epilogue_pc = self.builder.current_pc();
        for cj in &loop_ctx.continue_jumps {
            self.builder.patch_jump_d(*cj, epilogue_pc)?;
        }
        let back_pc = self.builder.emit_ad(Opcode::Jump, 0, 0);
        self.builder.patch_jump_d(back_pc, loop_start)?;

        let after_loop = self.builder.current_pc();
        self.builder.patch_jump_d(exit_jump, after_loop)?;
        for bj in &loop_ctx.break_jumps {
            self.builder.patch_jump_d(*bj, after_loop)?;
        }

        let (_, captured) = self.cur().pop_scope();
        if captured {
            self.builder.emit_abc(Opcode::CloseUpvalues, call_base, 0, 0);
        }
        Ok(())
    }

    fn compile_break(&mut self) -> CompileResult<()> {
        let floor = self
            .cur()
            .loops
            .last()
            .map(|l| l.register_floor)
            .ok_or_else(|| Self::err_outside_loop("break"))?;
        self.builder.emit_abc(Opcode::CloseUpvalues, floor, 0, 0);
        let jump = self.builder.emit_ad(Opcode::Jump, 0, 0);
        self.cur().loops.last_mut().expect("checked above").break_jumps.push(jump);
        Ok(())
    }

    fn compile_continue(&mut self) -> CompileResult<()> {
        let floor = self
            .cur()
            .loops
            .last()
            .map(|l| l.register_floor)
            .ok_or_else(|| Self::err_outside_loop("continue"))?;
        self.builder.emit_abc(Opcode::CloseUpvalues, floor, 0, 0);
        let jump = self.builder.emit_ad(Opcode::Jump, 0, 0);
        self.cur()
            .loops
            .last_mut()
            .expect("checked above")
            .continue_jumps
            .push(jump);
        Ok(())
    }

    fn compile_return(&mut self, exprs: &[Expr]) -> CompileResult<()> {
        let mark = self.cur().register_top();
        for e in exprs {
            let reg = self.cur().alloc_register()?;
            self.compile_expr_to(e, reg)?;
        }
        self.builder
            .emit_abc(Opcode::CallReturn, mark, (exprs.len() + 1) as u8, 0);
        self.cur().free_to(mark);
        Ok(())
    }

    fn compile_expr_stmt(&mut self, e: &Expr) -> CompileResult<()> {
        if let Expr::Call { callee, args, method } = e {
            self.compile_call_core(callee, args, method, 1)?;
        } else {
            let mark = self.cur().register_top();
            self.compile_expr(e)?;
            self.cur().free_to(mark);
        }
        Ok(())
    }

    fn compile_local_decl(&mut self, names: &[Rc<str>], values: &[Expr]) -> CompileResult<()> {
        for (i, name) in names.iter().enumerate() {
            if let Some(value) = values.get(i) {
                let reg = self.compile_expr(value)?;
                self.cur().bind_existing_local(Rc::clone(name), reg);
            } else {
                let reg = self.cur().declare_local(Rc::clone(name))?;
                self.builder.emit_abc(Opcode::LoadNull, reg, 0, 0);
            }
        }
        for extra in values.iter().skip(names.len()) {
            let mark = self.cur().register_top();
            self.compile_expr(extra)?;
            self.cur().free_to(mark);
        }
        Ok(())
    }

    fn compile_assign(&mut self, targets: &[LValue], values: &[Expr]) -> CompileResult<()> {
        let mark = self.cur().register_top();
        let mut regs = Vec::with_capacity(targets.len());
        for (i, _) in targets.iter().enumerate() {
            if let Some(value) = values.get(i) {
                regs.push(self.compile_expr(value)?);
            } else {
                let reg = self.cur().alloc_register()?;
                self.builder.emit_abc(Opcode::LoadNull, reg, 0, 0);
                regs.push(reg);
            }
        }
        for extra in values.iter().skip(targets.len()) {
            self.compile_expr(extra)?;
        }
        for (target, reg) in targets.iter().zip(regs.iter()) {
            self.store_lvalue(target, *reg)?;
        }
        self.cur().free_to(mark);
        Ok(())
    }

    fn compile_compound_assign(&mut self, target: &LValue, op: &BinOp, value: &Expr) -> CompileResult<()> {
        let mark = self.cur().register_top();
        let lhs_reg = self.cur().alloc_register()?;
        self.load_lvalue(target, lhs_reg)?;
        let rhs_reg = self.cur().alloc_register()?;
        self.compile_expr_to(value, rhs_reg)?;
        let result_reg = self.cur().alloc_register()?;
        self.emit_binary_op(op, result_reg, lhs_reg, rhs_reg)?;
        self.store_lvalue(target, result_reg)?;
        self.cur().free_to(mark);
        Ok(())
    }

    // -- LValues ----------------------------------------------------------

    fn load_lvalue(&mut self, target: &LValue, dest: u8) -> CompileResult<()> {
        match target {
            LValue::Local(name) => self.compile_identifier(name, dest)?,
            LValue::Global(name) => self.emit_load_global(dest, name)?,
            LValue::Index { object, key } => {
                let mark = self.cur().register_top();
                let obj = self.compile_expr(object)?;
                let key_reg = self.compile_expr(key)?;
                self.builder.emit_abc(Opcode::LoadTable, dest, obj, key_reg);
                self.cur().free_to(mark);
            }
            LValue::Field { object, name } => {
                let mark = self.cur().register_top();
                let obj = self.compile_expr(object)?;
                let key_reg = self.cur().alloc_register()?;
                let idx = self.builder.add_constant_string(name)?;
                self.emit_load_key(key_reg, idx)?;
                self.builder.emit_abc(Opcode::LoadTable, dest, obj, key_reg);
                self.cur().free_to(mark);
            }
        }
        Ok(())
    }

    fn store_lvalue(&mut self, target: &LValue, src: u8) -> CompileResult<()> {
        match target {
            LValue::Local(name) => match self.resolve_name(name)? {
                VarLoc::Local(reg) => {
                    if reg != src {
                        self.builder.emit_abc(Opcode::Move, reg, src, 0);
                    }
                }
                VarLoc::Upvalue(idx) => {
                    self.builder.emit_abc(Opcode::SetUpvalue, idx, src, 0);
                }
                VarLoc::Global => self.emit_store_global(name, src)?,
            },
            LValue::Global(name) => self.emit_store_global(name, src)?,
            LValue::Index { object, key } => {
                let mark = self.cur().register_top();
                let obj = self.compile_expr(object)?;
                let key_reg = self.compile_expr(key)?;
                self.builder.emit_abc(Opcode::StoreTable, obj, key_reg, src);
                self.cur().free_to(mark);
            }
            LValue::Field { object, name } => {
                let mark = self.cur().register_top();
                let obj = self.compile_expr(object)?;
                let idx = self.builder.add_constant_string(name)?;
                self.builder.emit_abc(Opcode::SetTableStringKey, obj, src, 0);
                self.builder.emit_aux(idx);
                self.cur().free_to(mark);
            }
        }
        Ok(())
    }

    // -- Expressions --------------------------------------------------------

    fn compile_expr(&mut self, expr: &Expr) -> CompileResult<u8> {
        let reg = self.cur().alloc_register()?;
        self.compile_expr_to(expr, reg)?;
        Ok(reg)
    }

    fn compile_expr_opt_to(&mut self, expr: Option<&Expr>, dest: u8) -> CompileResult<()> {
        match expr {
            Some(e) => self.compile_expr_to(e, dest),
            None => {
                self.builder.emit_abc(Opcode::LoadNull, dest, 0, 0);
                Ok(())
            }
        }
    }

    fn compile_expr_to(&mut self, expr: &Expr, dest: u8) -> CompileResult<()> {
        match expr {
            Expr::Null => {
                self.builder.emit_abc(Opcode::LoadNull, dest, 0, 0);
            }
            Expr::Bool(b) => {
                self.builder.emit_abc(Opcode::LoadBoolean, dest, *b as u8, 0);
            }
            Expr::Number(n) => {
                let idx = self.builder.add_constant_number(*n)?;
                self.emit_load_number(dest, idx)?;
            }
            Expr::Str(s) => {
                let idx = self.builder.add_constant_string(s)?;
                self.emit_load_key(dest, idx)?;
            }
            Expr::Varargs => {
                // Reads the first extra argument beyond the function's
                // declared parameters (stashed on the call frame at call
                // time, not addressable as an ordinary register, since
                // `...` may be referenced after its registers have been
                // reused for locals). Only the first extra value is
                // exposed; full multi-value vararg expansion is not
                // supported.
                self.builder.emit_ad(Opcode::PrepareVarargs, dest, 0);
            }
            Expr::Local(name) => self.compile_identifier(name, dest)?,
            Expr::Global(name) => self.emit_load_global(dest, name)?,
            Expr::Unary { op, operand } => self.compile_unary(op, operand, dest)?,
            Expr::Binary { op, lhs, rhs } => self.compile_binary(op, lhs, rhs, dest)?,
            Expr::Group(inner) => self.compile_expr_to(inner, dest)?,
            Expr::Call { callee, args, method } => {
                let func_reg = self.compile_call_core(callee, args, method, 2)?;
                if func_reg != dest {
                    self.builder.emit_abc(Opcode::Move, dest, func_reg, 0);
                }
            }
            Expr::Index { object, key } => {
                let mark = self.cur().register_top();
                let obj = self.compile_expr(object)?;
                let key_reg = self.compile_expr(key)?;
                self.builder.emit_abc(Opcode::LoadTable, dest, obj, key_reg);
                self.cur().free_to(mark);
            }
            Expr::Field { object, name } => {
                let mark = self.cur().register_top();
                let obj = self.compile_expr(object)?;
                let key_reg = self.cur().alloc_register()?;
                let idx = self.builder.add_constant_string(name)?;
                self.emit_load_key(key_reg, idx)?;
                self.builder.emit_abc(Opcode::LoadTable, dest, obj, key_reg);
                self.cur().free_to(mark);
            }
            Expr::Function(fb) => {
                let (child_id, upvalues) = self.compile_function(fb, fb.debug_name.clone())?;
                self.emit_new_closure(child_id, &upvalues, dest)?;
            }
            Expr::Table(fields) => self.compile_table(fields, dest)?,
            Expr::TypeAssertion { expr, .. } => self.compile_expr_to(expr, dest)?,
            Expr::IfElse {
                cond,
                then_expr,
                else_expr,
            } => self.compile_if_else_expr(cond, then_expr, else_expr, dest)?,
            Expr::Error(_) => {
                self.builder.emit_abc(Opcode::LoadNull, dest, 0, 0);
            }
        }
        Ok(())
    }

    fn compile_identifier(&mut self, name: &str, dest: u8) -> CompileResult<()> {
        match self.resolve_name(name)? {
            VarLoc::Local(reg) => {
                if reg != dest {
                    self.builder.emit_abc(Opcode::Move, dest, reg, 0);
                }
            }
            VarLoc::Upvalue(idx) => {
                self.builder.emit_abc(Opcode::GetUpvalue, dest, idx, 0);
            }
            VarLoc::Global => self.emit_load_global(dest, name)?,
        }
        Ok(())
    }

    fn compile_unary(&mut self, op: &UnOp, operand: &Expr, dest: u8) -> CompileResult<()> {
        self.compile_expr_to(operand, dest)?;
        let opcode = match op {
            UnOp::Neg => Opcode::Neg,
            UnOp::Not => Opcode::Not,
            UnOp::Len => Opcode::Len,
            UnOp::BitNot => Opcode::BNot,
        };
        self.builder.emit_abc(opcode, dest, dest, 0);
        Ok(())
    }

    fn compile_binary(&mut self, op: &BinOp, lhs: &Expr, rhs: &Expr, dest: u8) -> CompileResult<()> {
        match op {
            BinOp::And => {
                self.compile_expr_to(lhs, dest)?;
                let jump = self.builder.emit_ad(Opcode::JumpIfNot, dest, 0);
                self.compile_expr_to(rhs, dest)?;
                let end = self.builder.current_pc();
                self.builder.patch_jump_d(jump, end)?;
            }
            BinOp::Or => {
                self.compile_expr_to(lhs, dest)?;
                let jump = self.builder.emit_ad(Opcode::JumpIf, dest, 0);
                self.compile_expr_to(rhs, dest)?;
                let end = self.builder.current_pc();
                self.builder.patch_jump_d(jump, end)?;
            }
            _ => {
                if let (Expr::Number(n), Some(key_op)) = (rhs, key_opcode_for(op)) {
                    let idx = self.builder.add_constant_number(*n)?;
                    if idx <= i16::MAX as u32 {
                        self.compile_expr_to(lhs, dest)?;
                        self.builder.emit_ad(key_op, dest, idx as i16);
                        return Ok(());
                    }
                }
                let mark = self.cur().register_top();
                let lhs_reg = self.compile_expr(lhs)?;
                let rhs_reg = self.compile_expr(rhs)?;
                self.emit_binary_op(op, dest, lhs_reg, rhs_reg)?;
                self.cur().free_to(mark);
            }
        }
        Ok(())
    }

    fn emit_binary_op(&mut self, op: &BinOp, dest: u8, lhs: u8, rhs: u8) -> CompileResult<()> {
        match op {
            BinOp::Ne => {
                self.builder.emit_abc(Opcode::Eq, dest, lhs, rhs);
                self.builder.emit_abc(Opcode::Not, dest, dest, 0);
            }
            BinOp::Gt => {
                self.builder.emit_abc(Opcode::Lt, dest, rhs, lhs);
            }
            BinOp::Ge => {
                self.builder.emit_abc(Opcode::Le, dest, rhs, lhs);
            }
            BinOp::And | BinOp::Or => {
                unreachable!("short-circuit operators never reach emit_binary_op")
            }
            _ => {
                self.builder.emit_abc(plain_opcode_for(op), dest, lhs, rhs);
            }
        }
        Ok(())
    }

    fn compile_if_else_expr(&mut self, cond: &Expr, then_e: &Expr, else_e: &Expr, dest: u8) -> CompileResult<()> {
        let mark = self.cur().register_top();
        let cond_reg = self.compile_expr(cond)?;
        let false_jump = self.builder.emit_ad(Opcode::JumpIfNot, cond_reg, 0);
        self.cur().free_to(mark);
        self.compile_expr_to(then_e, dest)?;
        let end_jump = self.builder.emit_ad(Opcode::Jump, 0, 0);
        let else_pc = self.builder.current_pc();
        self.builder.patch_jump_d(false_jump, else_pc)?;
        self.compile_expr_to(else_e, dest)?;
        let end_pc = self.builder.current_pc();
        self.builder.patch_jump_d(end_jump, end_pc)?;
        Ok(())
    }

    fn compile_table(&mut self, fields: &[TableField], dest: u8) -> CompileResult<()> {
        self.builder.emit_ad(Opcode::NewTable, dest, 0);
        self.builder.emit_aux(fields.len() as u32);

        let mut positional_index: u32 = 0;
        let mut i = 0usize;
        while i < fields.len() {
            if matches!(fields[i], TableField::Positional(_)) {
                let run_start = self.cur().register_top();
                let mut count: u8 = 0;
                while i < fields.len() {
                    if let TableField::Positional(e) = &fields[i] {
                        let reg = self.cur().alloc_register()?;
                        self.compile_expr_to(e, reg)?;
                        count += 1;
                        i += 1;
                    } else {
                        break;
                    }
                }
                self.builder.emit_abc(Opcode::SetList, dest, count, positional_index as u8);
                positional_index += count as u32;
                self.cur().free_to(run_start);
                continue;
            }
            match &fields[i] {
                TableField::Named { name, value } => {
                    let mark = self.cur().register_top();
                    let value_reg = self.compile_expr(value)?;
                    let idx = self.builder.add_constant_string(name)?;
                    self.builder.emit_abc(Opcode::SetTableStringKey, dest, value_reg, 0);
                    self.builder.emit_aux(idx);
                    self.cur().free_to(mark);
                }
                TableField::Keyed { key, value } => {
                    let mark = self.cur().register_top();
                    let key_reg = self.compile_expr(key)?;
                    let value_reg = self.compile_expr(value)?;
                    self.builder.emit_abc(Opcode::StoreTable, dest, key_reg, value_reg);
                    self.cur().free_to(mark);
                }
                TableField::Positional(_) => unreachable!("handled by the run above"),
            }
            i += 1;
        }
        Ok(())
    }

    /// Compile a call (plain or `obj:method(...)`), leaving its first
    /// result (if `result_c > 1`) in the returned register.
    fn compile_call_core(
        &mut self,
        callee: &Expr,
        args: &[Expr],
        method: &Option<Rc<str>>,
        result_c: u8,
    ) -> CompileResult<u8> {
        let mark = self.cur().register_top();
        let (func_reg, has_self) = if let Some(name) = method {
            let func_reg = self.cur().alloc_register()?;
            let self_reg = self.cur().alloc_register()?;
            self.compile_expr_to(callee, self_reg)?;
            let idx = self.builder.add_constant_string(name)?;
            if idx <= u8::MAX as u32 {
                self.builder.emit_abc(Opcode::NamedCall, func_reg, self_reg, idx as u8);
            } else {
                let key_reg = self.cur().alloc_register()?;
                self.emit_load_key(key_reg, idx)?;
                self.builder.emit_abc(Opcode::LoadTable, func_reg, self_reg, key_reg);
                self.cur().free_to(self_reg + 1);
            }
            (func_reg, true)
        } else {
            let func_reg = self.cur().alloc_register()?;
            self.compile_expr_to(callee, func_reg)?;
            (func_reg, false)
        };
        for arg in args {
            let reg = self.cur().alloc_register()?;
            self.compile_expr_to(arg, reg)?;
        }
        let total_args = has_self as usize + args.len();
        self.builder.emit_abc(Opcode::Call, func_reg, (total_args + 1) as u8, result_c);
        self.cur().free_to(mark);
        Ok(func_reg)
    }

    // -- Small emitters -----------------------------------------------------

    fn emit_load_number(&mut self, dest: u8, const_idx: u32) -> CompileResult<()> {
        if const_idx > i16::MAX as u32 {
            return Err(CompileError::TooManyConstants {
                limit: i16::MAX as usize,
            });
        }
        self.builder.emit_ad(Opcode::LoadNumber, dest, const_idx as i16);
        Ok(())
    }

    fn emit_load_key(&mut self, dest: u8, const_idx: u32) -> CompileResult<()> {
        if const_idx <= i16::MAX as u32 {
            self.builder.emit_ad(Opcode::LoadKey, dest, const_idx as i16);
        } else {
            self.builder.emit_ad(Opcode::LoadKeyExtra, dest, 0);
            self.builder.emit_aux(const_idx);
        }
        Ok(())
    }

    fn emit_load_global(&mut self, dest: u8, name: &str) -> CompileResult<()> {
        let idx = self.builder.add_constant_string(name)?;
        self.builder.emit_ad(Opcode::LoadGlobal, dest, 0);
        self.builder.emit_aux(idx);
        Ok(())
    }

    fn emit_store_global(&mut self, name: &str, src: u8) -> CompileResult<()> {
        let idx = self.builder.add_constant_string(name)?;
        self.builder.emit_ad(Opcode::StoreGlobal, src, 0);
        self.builder.emit_aux(idx);
        Ok(())
    }
}

fn lvalue_debug_name(target: &LValue) -> Option<Rc<str>> {
    match target {
        LValue::Local(n) | LValue::Global(n) | LValue::Field { name: n, .. } => Some(Rc::clone(n)),
        LValue::Index { .. } => None,
    }
}

fn key_opcode_for(op: &BinOp) -> Option<Opcode> {
    Some(match op {
        BinOp::Add => Opcode::AddKey,
        BinOp::Sub => Opcode::SubKey,
        BinOp::Mul => Opcode::MulKey,
        BinOp::Div => Opcode::DivKey,
        BinOp::Mod => Opcode::ModKey,
        BinOp::Lt => Opcode::LtKey,
        BinOp::Le => Opcode::LeKey,
        BinOp::Eq => Opcode::EqKey,
        _ => return None,
    })
}

/// Maps a binary operator onto its plain register-register opcode.
/// `Concat` overloads `Add` (no dedicated concat opcode; the VM's `Add`
/// handler dispatches to string concatenation when either operand is a
/// string, mirroring how it already must dispatch to `__add` for tables).
fn plain_opcode_for(op: &BinOp) -> Opcode {
    match op {
        BinOp::BitOr => Opcode::BOr,
        BinOp::BitXor => Opcode::BXor,
        BinOp::BitAnd => Opcode::BAnd,
        BinOp::Eq => Opcode::Eq,
        BinOp::Lt => Opcode::Lt,
        BinOp::Le => Opcode::Le,
        BinOp::Shl => Opcode::Shl,
        BinOp::Shr => Opcode::Shr,
        BinOp::Add | BinOp::Concat => Opcode::Add,
        BinOp::Sub => Opcode::Sub,
        BinOp::Mul => Opcode::Mul,
        BinOp::Div => Opcode::Div,
        BinOp::Mod => Opcode::Mod,
        BinOp::Pow => Opcode::Pow,
        BinOp::Or | BinOp::And | BinOp::Ne | BinOp::Gt | BinOp::Ge => {
            unreachable!("handled before reaching plain_opcode_for")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::Stmt;

    fn compile_source_chunk(stmts: Vec<Stmt>) -> Module {
        compile(&Block { stmts }).expect("compile should succeed")
    }

    #[test]
    fn empty_chunk_compiles_to_a_single_return() {
        let module = compile_source_chunk(Vec::new());
        let main = &module.functions[module.main_function_id as usize];
        assert!(main.code.iter().any(|i| i.op() == Some(Opcode::CallReturn)));
    }

    #[test]
    fn local_decl_binds_initializer_register_directly() {
        let stmts = vec![Stmt::LocalDecl {
            names: vec![Rc::from("x")],
            values: vec![Expr::Number(1.0)],
        }];
        let module = compile_source_chunk(stmts);
        let main = &module.functions[module.main_function_id as usize];
        assert!(main.code.iter().any(|i| i.op() == Some(Opcode::LoadNumber)));
    }

    #[test]
    fn numeric_for_emits_prepare_and_back_edge() {
        let stmts = vec![Stmt::NumericFor {
            var: Rc::from("i"),
            start: Expr::Number(1.0),
            stop: Expr::Number(10.0),
            step: None,
            body: Block { stmts: vec![] },
            in_kw: SourceSpan::default(),
        }];
        let module = compile_source_chunk(stmts);
        let main = &module.functions[module.main_function_id as usize];
        let prepares = main
            .code
            .iter()
            .filter(|i| i.op() == Some(Opcode::ForNumericLoopPrepare))
            .count();
        let backs = main
            .code
            .iter()
            .filter(|i| i.op() == Some(Opcode::ForNumericLoop))
            .count();
        assert_eq!(prepares, 1);
        assert_eq!(backs, 1);
    }

    #[test]
    fn break_inside_while_jumps_past_the_loop() {
        let stmts = vec![Stmt::While {
            cond: Expr::Bool(true),
            body: Block {
                stmts: vec![Stmt::Break],
            },
            do_kw: SourceSpan::default(),
        }];
        let module = compile_source_chunk(stmts);
        let main = &module.functions[module.main_function_id as usize];
        assert!(main.code.iter().any(|i| i.op() == Some(Opcode::Jump)));
    }

    #[test]
    fn closure_over_enclosing_local_emits_capture() {
        let inner = FunctionBody {
            params: vec![],
            is_vararg: false,
            body: Block {
                stmts: vec![Stmt::Return(vec![Expr::Local(Rc::from("x"))])],
            },
            span: SourceSpan::default(),
            debug_name: None,
        };
        let stmts = vec![
            Stmt::LocalDecl {
                names: vec![Rc::from("x")],
                values: vec![Expr::Number(5.0)],
            },
            Stmt::LocalDecl {
                names: vec![Rc::from("f")],
                values: vec![Expr::Function(Rc::new(inner))],
            },
        ];
        let module = compile_source_chunk(stmts);
        let child = &module.functions[0];
        assert_eq!(child.capture_types.len(), 1);
    }

    #[test]
    fn string_concat_reuses_add_opcode() {
        let stmts = vec![Stmt::ExprStmt(Expr::Binary {
            op: BinOp::Concat,
            lhs: Box::new(Expr::Str(Rc::from("a"))),
            rhs: Box::new(Expr::Str(Rc::from("b"))),
        })];
        let module = compile_source_chunk(stmts);
        let main = &module.functions[module.main_function_id as usize];
        assert!(main.code.iter().any(|i| i.op() == Some(Opcode::Add)));
    }
}
