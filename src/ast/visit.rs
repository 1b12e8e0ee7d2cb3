//! Pre-order visitor protocol (§3 "a visitor hook that returns a boolean
//! controlling recursion", §9 "Visitor dispatch").
//!
//! The source's `ast_visitor::visit(node) -> bool` dispatches virtually;
//! here each `visit_*` method is a plain trait method invoked through a
//! tagged `match`, so there is no vtable indirection per node.

use super::*;

/// Implement to walk an AST. Every method defaults to recursing into
/// children; returning `false` from a `visit_*` method skips recursion
/// into that node's subtree (mirrors the source's pre-order controller).
pub trait Visitor {
    fn visit_expr(&mut self, _expr: &Expr) -> bool {
        true
    }
    fn visit_stmt(&mut self, _stmt: &Stmt) -> bool {
        true
    }

    fn walk_block(&mut self, block: &Block) {
        for stmt in &block.stmts {
            self.walk_stmt(stmt);
        }
    }

    fn walk_stmt(&mut self, stmt: &Stmt) {
        if !self.visit_stmt(stmt) {
            return;
        }
        match stmt {
            Stmt::Block(b) => self.walk_block(b),
            Stmt::If { arms, else_block } => {
                for (cond, body, _) in arms {
                    self.walk_expr(cond);
                    self.walk_block(body);
                }
                if let Some(b) = else_block {
                    self.walk_block(b);
                }
            }
            Stmt::While { cond, body, .. } => {
                self.walk_expr(cond);
                self.walk_block(body);
            }
            Stmt::Repeat { body, cond, .. } => {
                self.walk_block(body);
                self.walk_expr(cond);
            }
            Stmt::NumericFor {
                start,
                stop,
                step,
                body,
                ..
            } => {
                self.walk_expr(start);
                self.walk_expr(stop);
                if let Some(s) = step {
                    self.walk_expr(s);
                }
                self.walk_block(body);
            }
            Stmt::GenericFor { exprs, body, .. } => {
                for e in exprs {
                    self.walk_expr(e);
                }
                self.walk_block(body);
            }
            Stmt::Break | Stmt::Continue | Stmt::Error(_) => {}
            Stmt::Return(exprs) => {
                for e in exprs {
                    self.walk_expr(e);
                }
            }
            Stmt::ExprStmt(e) => self.walk_expr(e),
            Stmt::LocalDecl { values, .. } => {
                for e in values {
                    self.walk_expr(e);
                }
            }
            Stmt::Assign { targets, values } => {
                for t in targets {
                    self.walk_lvalue(t);
                }
                for e in values {
                    self.walk_expr(e);
                }
            }
            Stmt::CompoundAssign { target, value, .. } => {
                self.walk_lvalue(target);
                self.walk_expr(value);
            }
            Stmt::FunctionDecl { target, body } => {
                self.walk_lvalue(target);
                self.walk_block(&body.body);
            }
            Stmt::LocalFunctionDecl { body, .. } => self.walk_block(&body.body),
            Stmt::TypeAlias { .. }
            | Stmt::DeclareGlobal { .. }
            | Stmt::DeclareFunction { .. }
            | Stmt::DeclareClass { .. } => {}
        }
    }

    fn walk_lvalue(&mut self, lvalue: &LValue) {
        match lvalue {
            LValue::Local(_) | LValue::Global(_) => {}
            LValue::Index { object, key } => {
                self.walk_expr(object);
                self.walk_expr(key);
            }
            LValue::Field { object, .. } => self.walk_expr(object),
        }
    }

    fn walk_expr(&mut self, expr: &Expr) {
        if !self.visit_expr(expr) {
            return;
        }
        match expr {
            Expr::Null
            | Expr::Bool(_)
            | Expr::Number(_)
            | Expr::Str(_)
            | Expr::Varargs
            | Expr::Local(_)
            | Expr::Global(_)
            | Expr::Error(_) => {}
            Expr::Unary { operand, .. } => self.walk_expr(operand),
            Expr::Binary { lhs, rhs, .. } => {
                self.walk_expr(lhs);
                self.walk_expr(rhs);
            }
            Expr::Group(inner) => self.walk_expr(inner),
            Expr::Call { callee, args, .. } => {
                self.walk_expr(callee);
                for a in args {
                    self.walk_expr(a);
                }
            }
            Expr::Index { object, key } => {
                self.walk_expr(object);
                self.walk_expr(key);
            }
            Expr::Field { object, .. } => self.walk_expr(object),
            Expr::Function(f) => self.walk_block(&f.body),
            Expr::Table(fields) => {
                for field in fields {
                    match field {
                        TableField::Positional(e) => self.walk_expr(e),
                        TableField::Keyed { key, value } => {
                            self.walk_expr(key);
                            self.walk_expr(value);
                        }
                        TableField::Named { value, .. } => self.walk_expr(value),
                    }
                }
            }
            Expr::TypeAssertion { expr, .. } => self.walk_expr(expr),
            Expr::IfElse {
                cond,
                then_expr,
                else_expr,
            } => {
                self.walk_expr(cond);
                self.walk_expr(then_expr);
                self.walk_expr(else_expr);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Counter {
        exprs: usize,
        stmts: usize,
    }

    impl Visitor for Counter {
        fn visit_expr(&mut self, _expr: &Expr) -> bool {
            self.exprs += 1;
            true
        }
        fn visit_stmt(&mut self, _stmt: &Stmt) -> bool {
            self.stmts += 1;
            true
        }
    }

    #[test]
    fn counts_nested_nodes() {
        let block = Block {
            stmts: vec![Stmt::ExprStmt(Expr::Binary {
                op: BinOp::Add,
                lhs: Box::new(Expr::Number(1.0)),
                rhs: Box::new(Expr::Number(2.0)),
            })],
        };
        let mut counter = Counter { exprs: 0, stmts: 0 };
        counter.walk_block(&block);
        assert_eq!(counter.stmts, 1);
        assert_eq!(counter.exprs, 3);
    }

    #[test]
    fn stopping_visit_skips_subtree() {
        struct StopAtBinary {
            seen: usize,
        }
        impl Visitor for StopAtBinary {
            fn visit_expr(&mut self, expr: &Expr) -> bool {
                self.seen += 1;
                !matches!(expr, Expr::Binary { .. })
            }
        }
        let expr = Expr::Binary {
            op: BinOp::Add,
            lhs: Box::new(Expr::Number(1.0)),
            rhs: Box::new(Expr::Number(2.0)),
        };
        let mut v = StopAtBinary { seen: 0 };
        v.walk_expr(&expr);
        assert_eq!(v.seen, 1);
    }
}
