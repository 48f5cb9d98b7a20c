//! The analyzer: raw data to typed AST.
//!
//! Walks a datum, resolves lexical scope against the environment chain, and
//! produces `Ast` nodes. Head symbols resolving to core-form markers select
//! a specific analyzer; heads resolving to primitives become `PrimApp`
//! nodes; macro bindings are rejected (a future expander hangs off that
//! arm); anything else is a general application.
//!
//! Variable references resolve through `lookup_or_create`, so a reference
//! to a not-yet-defined global mints its cell up front and every later
//! `define` of that name mutates the same cell. References bound by a
//! lambda record that lambda as their location; the free-variable pass at
//! the bottom of this module turns those locations into per-lambda capture
//! sets.

use crate::{
    ast::{Ast, CoreForm, LambdaId, LambdaNode, Loc, RefNode},
    env,
    exception::CompileError,
    heap::{Heap, HeapData, HeapId},
    intern::{Interns, SymbolId},
    resource::ResourceTracker,
    value::Value,
};

type AnalyzeResult<T> = Result<T, Box<CompileError>>;

/// Product of a successful analysis: the root AST plus the lambda arena the
/// compiler walks alongside it.
#[derive(Debug)]
pub(crate) struct Analysis {
    pub root: Ast,
    pub lambdas: Vec<LambdaNode>,
}

pub(crate) struct Analyzer<'a, T: ResourceTracker> {
    heap: &'a mut Heap<T>,
    interns: &'a Interns,
    lambdas: Vec<LambdaNode>,
}

impl<'a, T: ResourceTracker> Analyzer<'a, T> {
    /// Analyzes a complete expression and runs the free-variable pass.
    pub fn analyze_program(
        heap: &'a mut Heap<T>,
        interns: &'a Interns,
        expr: Value,
        env: HeapId,
    ) -> AnalyzeResult<Analysis> {
        let mut analyzer = Self {
            heap,
            interns,
            lambdas: Vec::new(),
        };
        let root = analyzer.analyze(expr, env)?;
        let mut lambdas = analyzer.lambdas;
        let mut escaped = Vec::new();
        free_vars(&root, &mut lambdas, &mut escaped);
        if let Some(stray) = escaped.first() {
            return Err(CompileError::new(
                format!("unbound identifier: {}", interns.resolve(stray.name)),
                vec![],
            ));
        }
        Ok(Analysis { root, lambdas })
    }

    fn analyze(&mut self, expr: Value, env: HeapId) -> AnalyzeResult<Ast> {
        let mut expr = expr;
        let mut env = env;
        loop {
            match expr {
                Value::Ref(id) => match self.heap.get(id) {
                    HeapData::Pair(car, cdr) => {
                        let (car, cdr) = (*car, *cdr);
                        return self.analyze_pair(expr, car, cdr, env);
                    }
                    // a syntactic closure re-analyzes its expression in the
                    // environment it carries
                    HeapData::Synclo(synclo) => {
                        env = synclo.env;
                        expr = synclo.expr;
                    }
                    _ => return Ok(Ast::Lit(expr)),
                },
                Value::Symbol(name) => {
                    let target = self.var_ref_node(name, env)?;
                    return Ok(Ast::Ref(target));
                }
                _ => return Ok(Ast::Lit(expr)),
            }
        }
    }

    fn analyze_pair(&mut self, whole: Value, car: Value, cdr: Value, env: HeapId) -> AnalyzeResult<Ast> {
        if let Some(head) = self.identifier_of(car) {
            if let Some(cell) = env::lookup(self.heap, env, head) {
                match env::cell_value(self.heap, cell) {
                    Value::Core(form) => return self.analyze_core(form, whole, cdr, env),
                    Value::Primitive(prim) => {
                        let args = self.analyze_each(cdr, env)?;
                        return Ok(Ast::PrimApp { prim, args });
                    }
                    Value::Ref(id) if matches!(self.heap.get(id), HeapData::Macro(_)) => {
                        return Err(CompileError::of_value(
                            "macros are not supported",
                            whole,
                            self.heap,
                            self.interns,
                        ));
                    }
                    _ => {}
                }
            }
        }
        // general application: operator and arguments analyzed in order
        let items = self.analyze_each(whole, env)?;
        debug_assert!(!items.is_empty());
        Ok(Ast::App(items))
    }

    fn analyze_core(&mut self, form: CoreForm, whole: Value, cdr: Value, env: HeapId) -> AnalyzeResult<Ast> {
        let items = self.proper_list(cdr).ok_or_else(|| self.bad_syntax(form, whole))?;
        match form {
            CoreForm::Define => self.analyze_define(&items, whole, env),
            CoreForm::Set => self.analyze_set(&items, whole, env),
            CoreForm::Lambda => {
                if items.is_empty() {
                    return Err(self.bad_syntax(form, whole));
                }
                self.analyze_lambda(items[0], &items[1..], env)
            }
            CoreForm::If => {
                if items.len() < 2 || items.len() > 3 {
                    return Err(self.bad_syntax(form, whole));
                }
                let test = self.analyze(items[0], env)?;
                let pass = self.analyze(items[1], env)?;
                let fail = match items.get(2) {
                    Some(&alt) => self.analyze(alt, env)?,
                    None => Ast::Lit(Value::Undefined),
                };
                Ok(Ast::Cnd {
                    test: Box::new(test),
                    pass: Box::new(pass),
                    fail: Box::new(fail),
                })
            }
            CoreForm::Begin => self.analyze_seq(&items, env),
            CoreForm::Quote => {
                if items.len() != 1 {
                    return Err(self.bad_syntax(form, whole));
                }
                Ok(Ast::Lit(items[0]))
            }
        }
    }

    fn analyze_define(&mut self, items: &[Value], whole: Value, env: HeapId) -> AnalyzeResult<Ast> {
        let Some(&target) = items.first() else {
            return Err(self.bad_syntax(CoreForm::Define, whole));
        };
        // (define (name . formals) body...) is lambda sugar
        let (name, lambda_parts) = match target {
            Value::Symbol(name) => {
                if items.len() != 2 {
                    return Err(self.bad_syntax(CoreForm::Define, whole));
                }
                (name, None)
            }
            Value::Ref(id) => match self.heap.get(id) {
                HeapData::Pair(head, formals) => {
                    let (head, formals) = (*head, *formals);
                    let Some(name) = self.identifier_of(head) else {
                        return Err(self.bad_syntax(CoreForm::Define, whole));
                    };
                    (name, Some(formals))
                }
                _ => return Err(self.bad_syntax(CoreForm::Define, whole)),
            },
            _ => return Err(self.bad_syntax(CoreForm::Define, whole)),
        };

        // bind before analyzing the value so recursive definitions resolve
        // to their own binding
        let owner = self.frame_lambda(env);
        let target = if let Some(owner_id) = owner {
            let node = &mut self.lambdas[owner_id.index()];
            if !node.locals.contains(&name) {
                node.locals.push(name);
            }
            // a definition is an assignment: the binding must be boxed so
            // closures share it
            if !node.set_vars.contains(&name) {
                node.set_vars.push(name);
            }
            env::define(self.heap, env, name, Value::LambdaLoc(owner_id))?;
            RefNode {
                name,
                loc: Loc::Lambda(owner_id),
            }
        } else {
            let cell = env::lookup_or_create(self.heap, env, name, Value::Undefined)?;
            RefNode {
                name,
                loc: Loc::Global(cell),
            }
        };

        let value = match lambda_parts {
            Some(formals) => self.analyze_lambda(formals, &items[1..], env)?,
            None => self.analyze(items[1], env)?,
        };
        Ok(Ast::Set {
            target,
            value: Box::new(value),
        })
    }

    fn analyze_set(&mut self, items: &[Value], whole: Value, env: HeapId) -> AnalyzeResult<Ast> {
        let &[target, value] = items else {
            return Err(self.bad_syntax(CoreForm::Set, whole));
        };
        let Some(name) = self.identifier_of(target) else {
            return Err(self.bad_syntax(CoreForm::Set, whole));
        };
        let target = self.var_ref_node(name, env)?;
        if let Loc::Lambda(owner) = target.loc {
            let node = &mut self.lambdas[owner.index()];
            if !node.set_vars.contains(&name) {
                node.set_vars.push(name);
            }
        }
        let value = self.analyze(value, env)?;
        Ok(Ast::Set {
            target,
            value: Box::new(value),
        })
    }

    fn analyze_lambda(&mut self, formals: Value, body: &[Value], env: HeapId) -> AnalyzeResult<Ast> {
        let (params, variadic) = self.flatten_params(formals)?;
        let id = LambdaId::new(self.lambdas.len());
        self.lambdas.push(LambdaNode {
            params: params.clone(),
            variadic,
            ..LambdaNode::default()
        });
        let body_env = env::extend(self.heap, env, &params, Value::LambdaLoc(id), Some(id))?;
        let body_ast = self.analyze_seq(body, body_env)?;
        self.lambdas[id.index()].body = Some(body_ast);
        Ok(Ast::Lambda(id))
    }

    fn analyze_seq(&mut self, items: &[Value], env: HeapId) -> AnalyzeResult<Ast> {
        match items {
            [] => Ok(Ast::Lit(Value::Undefined)),
            [only] => self.analyze(*only, env),
            _ => {
                let mut analyzed = Vec::with_capacity(items.len());
                for &item in items {
                    analyzed.push(self.analyze(item, env)?);
                }
                Ok(Ast::Seq(analyzed))
            }
        }
    }

    fn var_ref_node(&mut self, name: SymbolId, env: HeapId) -> AnalyzeResult<RefNode> {
        let cell = env::lookup_or_create(self.heap, env, name, Value::Undefined)?;
        let loc = match env::cell_value(self.heap, cell) {
            Value::LambdaLoc(id) => Loc::Lambda(id),
            _ => Loc::Global(cell),
        };
        debug_assert_eq!(
            matches!(loc, Loc::Global(_)),
            env::global_p(self.heap, env, name),
            "location discrimination must agree with the frame walk"
        );
        Ok(RefNode { name, loc })
    }

    /// Unwraps syntactic-closure layers down to a symbol, if any.
    fn identifier_of(&self, mut v: Value) -> Option<SymbolId> {
        loop {
            match v {
                Value::Symbol(name) => return Some(name),
                Value::Ref(id) => match self.heap.get(id) {
                    HeapData::Synclo(synclo) => v = synclo.expr,
                    _ => return None,
                },
                _ => return None,
            }
        }
    }

    /// Collects a proper list into a vector; `None` for dotted lists.
    fn proper_list(&self, mut v: Value) -> Option<Vec<Value>> {
        let mut items = Vec::new();
        loop {
            match v {
                Value::Nil => return Some(items),
                Value::Ref(id) => match self.heap.get(id) {
                    HeapData::Pair(car, cdr) => {
                        items.push(*car);
                        v = *cdr;
                    }
                    _ => return None,
                },
                _ => return None,
            }
        }
    }

    fn analyze_each(&mut self, list: Value, env: HeapId) -> AnalyzeResult<Vec<Ast>> {
        let items = self
            .proper_list(list)
            .ok_or_else(|| CompileError::of_value("bad application syntax", list, self.heap, self.interns))?;
        let mut analyzed = Vec::with_capacity(items.len());
        for item in items {
            analyzed.push(self.analyze(item, env)?);
        }
        Ok(analyzed)
    }

    /// Flattens a parameter list, dotted or bare-symbol, into a symbol
    /// vector plus a variadic flag. The rest name is last.
    fn flatten_params(&self, mut v: Value) -> AnalyzeResult<(Vec<SymbolId>, bool)> {
        let mut params = Vec::new();
        loop {
            match v {
                Value::Nil => return Ok((params, false)),
                Value::Symbol(rest) => {
                    params.push(rest);
                    return Ok((params, true));
                }
                Value::Ref(id) => match self.heap.get(id) {
                    HeapData::Pair(Value::Symbol(param), cdr) => {
                        params.push(*param);
                        v = *cdr;
                    }
                    _ => {
                        return Err(CompileError::of_value(
                            "parameter list must contain symbols",
                            v,
                            self.heap,
                            self.interns,
                        ))
                    }
                },
                _ => {
                    return Err(CompileError::of_value(
                        "parameter list must contain symbols",
                        v,
                        self.heap,
                        self.interns,
                    ))
                }
            }
        }
    }

    fn frame_lambda(&self, env: HeapId) -> Option<LambdaId> {
        match self.heap.get(env) {
            HeapData::Env(frame) => frame.lambda,
            other => panic!("expected environment, found {other:?}"),
        }
    }

    fn bad_syntax(&self, form: CoreForm, whole: Value) -> Box<CompileError> {
        CompileError::of_value(format!("bad {form} syntax"), whole, self.heap, self.interns)
    }
}

/// Post-order free-variable pass.
///
/// For each lambda, collects every reference in its body whose location is a
/// *different* lambda, deduplicated by `(name, loc)` identity, and stores
/// the result on the lambda node. References located at enclosing lambdas
/// propagate upward into `fv` so outer lambdas capture them transitively.
pub(crate) fn free_vars(x: &Ast, lambdas: &mut [LambdaNode], fv: &mut Vec<RefNode>) {
    match x {
        Ast::Lambda(id) => {
            let index = id.index();
            let body = lambdas[index].body.take().expect("lambda body missing");
            let mut inner = Vec::new();
            free_vars(&body, lambdas, &mut inner);
            lambdas[index].body = Some(body);
            let own = Loc::Lambda(*id);
            let captured: Vec<RefNode> = inner.into_iter().filter(|r| r.loc != own).collect();
            for &r in &captured {
                insert_free_var(r, fv);
            }
            lambdas[index].free_vars = captured;
        }
        Ast::Ref(r) => {
            if matches!(r.loc, Loc::Lambda(_)) {
                insert_free_var(*r, fv);
            }
        }
        Ast::Set { target, value } => {
            free_vars(value, lambdas, fv);
            if matches!(target.loc, Loc::Lambda(_)) {
                insert_free_var(*target, fv);
            }
        }
        Ast::Cnd { test, pass, fail } => {
            free_vars(test, lambdas, fv);
            free_vars(pass, lambdas, fv);
            free_vars(fail, lambdas, fv);
        }
        Ast::Seq(items) | Ast::App(items) => {
            for item in items {
                free_vars(item, lambdas, fv);
            }
        }
        Ast::PrimApp { args, .. } => {
            for arg in args {
                free_vars(arg, lambdas, fv);
            }
        }
        Ast::Lit(_) => {}
    }
}

/// Inserts a reference if no equal `(name, loc)` pair is already present.
fn insert_free_var(r: RefNode, fv: &mut Vec<RefNode>) {
    if !fv.contains(&r) {
        fv.push(r);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        env::EnvFrame,
        heap::{Macro, Synclo},
        parse::read_all,
        resource::NoLimitTracker,
    };

    struct Fixture {
        heap: Heap<NoLimitTracker>,
        interns: Interns,
        env: HeapId,
    }

    impl Fixture {
        fn new() -> Self {
            let mut heap = Heap::new(NoLimitTracker);
            let mut interns = Interns::new();
            let env = heap.allocate(HeapData::Env(EnvFrame::default())).unwrap();
            for form in [
                CoreForm::Define,
                CoreForm::Set,
                CoreForm::Lambda,
                CoreForm::If,
                CoreForm::Begin,
                CoreForm::Quote,
            ] {
                let name = interns.intern(&form.to_string());
                env::define(&mut heap, env, name, Value::Core(form)).unwrap();
            }
            Self { heap, interns, env }
        }

        fn analyze(&mut self, source: &str) -> AnalyzeResult<Analysis> {
            let data = read_all(source, &mut self.heap, &mut self.interns).unwrap();
            assert_eq!(data.len(), 1);
            Analyzer::analyze_program(&mut self.heap, &self.interns, data[0], self.env)
        }
    }

    #[test]
    fn symbol_analyzes_to_global_ref_with_live_cell() {
        let mut fx = Fixture::new();
        let analysis = fx.analyze("x").unwrap();
        let Ast::Ref(r) = analysis.root else {
            panic!("expected ref, got {:?}", analysis.root)
        };
        let Loc::Global(cell) = r.loc else {
            panic!("top-level reference must be global")
        };
        // the forward-reference cell is already installed at the root
        let name = fx.interns.intern("x");
        assert_eq!(env::lookup(&fx.heap, fx.env, name), Some(cell));
    }

    #[test]
    fn lambda_params_resolve_to_owner() {
        let mut fx = Fixture::new();
        let analysis = fx.analyze("(lambda (x y) y)").unwrap();
        let Ast::Lambda(id) = analysis.root else { panic!() };
        let node = &analysis.lambdas[id.index()];
        assert_eq!(node.params.len(), 2);
        assert!(!node.variadic);
        let Some(Ast::Ref(r)) = &node.body else { panic!() };
        assert_eq!(r.loc, Loc::Lambda(id));
        assert!(node.free_vars.is_empty());
    }

    #[test]
    fn dotted_and_bare_parameter_lists_are_variadic() {
        let mut fx = Fixture::new();
        let analysis = fx.analyze("(lambda (a . rest) rest)").unwrap();
        let Ast::Lambda(id) = analysis.root else { panic!() };
        let node = &analysis.lambdas[id.index()];
        assert!(node.variadic);
        assert_eq!(node.params.len(), 2);
        assert_eq!(node.min_args(), 1);

        let analysis = fx.analyze("(lambda all all)").unwrap();
        let Ast::Lambda(id) = analysis.root else { panic!() };
        let node = &analysis.lambdas[id.index()];
        assert!(node.variadic);
        assert_eq!(node.min_args(), 0);
    }

    #[test]
    fn set_marks_the_owning_lambda() {
        let mut fx = Fixture::new();
        let analysis = fx.analyze("(lambda (x) (set! x 1))").unwrap();
        let Ast::Lambda(id) = analysis.root else { panic!() };
        let node = &analysis.lambdas[id.index()];
        let x = fx.interns.intern("x");
        assert_eq!(node.set_vars, vec![x]);
    }

    #[test]
    fn internal_define_is_local_boxed_and_capturable() {
        let mut fx = Fixture::new();
        let analysis = fx
            .analyze("(lambda () (define c 0) (lambda () (set! c (begin c)) c))")
            .unwrap();
        let Ast::Lambda(outer) = analysis.root else { panic!() };
        let c = fx.interns.intern("c");
        let outer_node = &analysis.lambdas[outer.index()];
        assert_eq!(outer_node.locals, vec![c]);
        assert!(outer_node.set_vars.contains(&c));
        // the inner lambda captures c from the outer one
        let inner_node = analysis
            .lambdas
            .iter()
            .find(|n| !n.free_vars.is_empty())
            .expect("inner lambda captures something");
        assert_eq!(
            inner_node.free_vars,
            vec![RefNode {
                name: c,
                loc: Loc::Lambda(outer)
            }]
        );
        // no lambda captures its own bindings
        for (i, node) in analysis.lambdas.iter().enumerate() {
            for fv in &node.free_vars {
                assert_ne!(fv.loc, Loc::Lambda(LambdaId::new(i)));
            }
        }
    }

    #[test]
    fn free_var_identity_is_name_plus_location() {
        let mut fx = Fixture::new();
        // two distinct `x` bindings captured by the innermost lambda
        let analysis = fx
            .analyze("(lambda (x) (lambda (y) (lambda () (begin x y))))")
            .unwrap();
        let innermost = analysis
            .lambdas
            .iter()
            .find(|n| n.free_vars.len() == 2)
            .expect("innermost lambda captures both");
        assert_ne!(innermost.free_vars[0].loc, innermost.free_vars[1].loc);
        // the middle lambda transitively captures x
        let middle = analysis
            .lambdas
            .iter()
            .find(|n| n.free_vars.len() == 1)
            .expect("middle lambda captures x");
        let x = fx.interns.intern("x");
        assert_eq!(middle.free_vars[0].name, x);
    }

    #[test]
    fn macros_are_rejected() {
        let mut fx = Fixture::new();
        let name = fx.interns.intern("my-macro");
        let dummy = fx
            .heap
            .allocate(HeapData::Macro(Macro {
                proc: Value::Undefined,
                env: fx.env,
            }))
            .unwrap();
        env::define(&mut fx.heap, fx.env, name, Value::Ref(dummy)).unwrap();
        let err = fx.analyze("(my-macro 1 2)").unwrap_err();
        assert!(err.message.contains("macros are not supported"));
    }

    #[test]
    fn syntactic_closures_reanalyze_in_their_environment() {
        let mut fx = Fixture::new();
        let data = read_all("x", &mut fx.heap, &mut fx.interns).unwrap();
        let synclo = fx
            .heap
            .allocate(HeapData::Synclo(Synclo {
                env: fx.env,
                expr: data[0],
            }))
            .unwrap();
        let analysis =
            Analyzer::analyze_program(&mut fx.heap, &fx.interns, Value::Ref(synclo), fx.env).unwrap();
        assert!(matches!(analysis.root, Ast::Ref(_)));
    }

    #[test]
    fn bad_forms_are_compile_errors() {
        let mut fx = Fixture::new();
        assert!(fx.analyze("(set! 3 4)").is_err());
        assert!(fx.analyze("(define)").is_err());
        assert!(fx.analyze("(if)").is_err());
        assert!(fx.analyze("(lambda (1) 2)").is_err());
        assert!(fx.analyze("(quote a b)").is_err());
    }
}
