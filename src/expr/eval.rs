use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use regex::Regex;
use serde_json::{Map, Value};

use super::functions;
use super::parser::{BinOp, Node};
use crate::value::{number_value, to_text};

/// Result of evaluating a node. `Undefined` is the empty sequence: it is
/// dropped from arrays and objects and surfaces as `null` at the top level.
#[derive(Clone)]
pub(crate) enum Val<'a> {
    Undefined,
    Json(Value),
    Func(Callable<'a>),
}

#[derive(Clone)]
pub(crate) enum Callable<'a> {
    Builtin(&'static str),
    Regex(Regex),
    Lambda {
        params: &'a [String],
        body: &'a Node,
        env: Env<'a>,
    },
}

pub(crate) type Env<'a> = Rc<Frame<'a>>;

pub(crate) struct Frame<'a> {
    vars: RefCell<HashMap<String, Val<'a>>>,
    parent: Option<Env<'a>>,
}

impl<'a> Frame<'a> {
    fn root(vars: &Map<String, Value>) -> Env<'a> {
        let bound = vars
            .iter()
            .map(|(name, value)| (name.clone(), Val::Json(value.clone())))
            .collect();
        Rc::new(Frame {
            vars: RefCell::new(bound),
            parent: None,
        })
    }

    fn child(parent: &Env<'a>) -> Env<'a> {
        Rc::new(Frame {
            vars: RefCell::new(HashMap::new()),
            parent: Some(Rc::clone(parent)),
        })
    }

    fn lookup(&self, name: &str) -> Option<Val<'a>> {
        if let Some(found) = self.vars.borrow().get(name) {
            return Some(found.clone());
        }
        self.parent.as_ref().and_then(|parent| parent.lookup(name))
    }

    fn bind(&self, name: &str, value: Val<'a>) {
        self.vars.borrow_mut().insert(name.to_string(), value);
    }
}

/// Evaluate `node` against `input`, with `vars` bound as `$name`.
pub(crate) fn evaluate(node: &Node, input: &Value, vars: &Map<String, Value>) -> Result<Value, String> {
    let evaluator = Evaluator { input };
    let env = Frame::root(vars);
    match evaluator.eval(node, input, &env)? {
        Val::Undefined => Ok(Value::Null),
        Val::Json(value) => Ok(value),
        Val::Func(_) => Err("expression evaluates to a function".to_string()),
    }
}

pub(crate) struct Evaluator<'a> {
    input: &'a Value,
}

impl<'a> Evaluator<'a> {
    pub(crate) fn eval(&self, node: &'a Node, ctx: &Value, env: &Env<'a>) -> Result<Val<'a>, String> {
        match node {
            Node::Number(num) => number_value(*num)
                .map(Val::Json)
                .ok_or_else(|| format!("number {num} is out of range")),
            Node::Str(text) => Ok(Val::Json(Value::String(text.clone()))),
            Node::Bool(flag) => Ok(Val::Json(Value::Bool(*flag))),
            Node::Null => Ok(Val::Json(Value::Null)),
            Node::Regex(re) => Ok(Val::Func(Callable::Regex(re.clone()))),
            Node::Name(name) => Ok(lookup_field(ctx, name)),
            Node::Wildcard => Ok(wildcard(ctx)),
            Node::Context => Ok(Val::Json(ctx.clone())),
            Node::Root => Ok(Val::Json(self.input.clone())),
            Node::Variable(name) => Ok(match env.lookup(name) {
                Some(found) => found,
                None => functions::builtin(name)
                    .map(|name| Val::Func(Callable::Builtin(name)))
                    .unwrap_or(Val::Undefined),
            }),
            Node::Path(left, right) => self.eval_path(left, right, ctx, env),
            Node::Filter(left, predicate) => self.eval_filter(left, predicate, ctx, env),
            Node::Negate(inner) => match self.eval(inner, ctx, env)? {
                Val::Undefined => Ok(Val::Undefined),
                Val::Json(Value::Number(num)) => negate(num.as_f64().unwrap_or(0.0)),
                _ => Err("cannot negate a non-number".to_string()),
            },
            Node::Binary(op, left, right) => self.eval_binary(*op, left, right, ctx, env),
            Node::Condition(cond, then, otherwise) => {
                if is_true(&self.eval(cond, ctx, env)?) {
                    self.eval(then, ctx, env)
                } else if let Some(otherwise) = otherwise {
                    self.eval(otherwise, ctx, env)
                } else {
                    Ok(Val::Undefined)
                }
            }
            Node::Call(callee, args) => {
                let callee = self.eval(callee, ctx, env)?;
                let mut values = Vec::with_capacity(args.len());
                for arg in args {
                    values.push(self.eval(arg, ctx, env)?);
                }
                self.invoke(callee, values, ctx)
            }
            Node::Chain(left, right) => {
                let lhs = self.eval(left, ctx, env)?;
                match right.as_ref() {
                    Node::Call(callee, args) => {
                        let callee = self.eval(callee, ctx, env)?;
                        let mut values = Vec::with_capacity(args.len() + 1);
                        values.push(lhs);
                        for arg in args {
                            values.push(self.eval(arg, ctx, env)?);
                        }
                        self.invoke(callee, values, ctx)
                    }
                    other => {
                        let callee = self.eval(other, ctx, env)?;
                        self.invoke(callee, vec![lhs], ctx)
                    }
                }
            }
            Node::Lambda(params, body) => Ok(Val::Func(Callable::Lambda {
                params,
                body,
                env: Rc::clone(env),
            })),
            Node::Array(items) => {
                let mut out = Vec::new();
                for item in items {
                    match self.eval(item, ctx, env)? {
                        Val::Undefined => {}
                        Val::Json(Value::Array(inner)) if !matches!(item, Node::Array(_)) => {
                            out.extend(inner)
                        }
                        Val::Json(value) => out.push(value),
                        Val::Func(_) => return Err("functions cannot be stored in arrays".to_string()),
                    }
                }
                Ok(Val::Json(Value::Array(out)))
            }
            Node::Object(pairs) => {
                let mut map = Map::new();
                for (key, value) in pairs {
                    let key = match self.eval(key, ctx, env)? {
                        Val::Json(Value::String(text)) => text,
                        Val::Json(other) => to_text(&other),
                        Val::Undefined => continue,
                        Val::Func(_) => return Err("object keys must be strings".to_string()),
                    };
                    match self.eval(value, ctx, env)? {
                        Val::Undefined => {}
                        Val::Json(value) => {
                            map.insert(key, value);
                        }
                        Val::Func(_) => {
                            return Err("functions cannot be stored in objects".to_string())
                        }
                    }
                }
                Ok(Val::Json(Value::Object(map)))
            }
            Node::Block(exprs) => {
                let scope = Frame::child(env);
                let mut last = Val::Undefined;
                for expr in exprs {
                    last = self.eval(expr, ctx, &scope)?;
                }
                Ok(last)
            }
            Node::Bind(name, expr) => {
                let value = self.eval(expr, ctx, env)?;
                env.bind(name, value.clone());
                Ok(value)
            }
        }
    }

    fn eval_path(
        &self,
        left: &'a Node,
        right: &'a Node,
        ctx: &Value,
        env: &Env<'a>,
    ) -> Result<Val<'a>, String> {
        match self.eval(left, ctx, env)? {
            Val::Undefined => Ok(Val::Undefined),
            Val::Func(_) => Err("cannot navigate into a function".to_string()),
            Val::Json(Value::Array(items)) => {
                let keep_arrays = matches!(right, Node::Array(_));
                let mut out = Vec::new();
                for item in &items {
                    match self.eval(right, item, env)? {
                        Val::Undefined => {}
                        Val::Json(Value::Array(inner)) if !keep_arrays => out.extend(inner),
                        Val::Json(value) => out.push(value),
                        Val::Func(_) => return Err("path step evaluates to a function".to_string()),
                    }
                }
                if out.is_empty() {
                    Ok(Val::Undefined)
                } else {
                    Ok(Val::Json(Value::Array(out)))
                }
            }
            Val::Json(single) => self.eval(right, &single, env),
        }
    }

    fn eval_filter(
        &self,
        left: &'a Node,
        predicate: &'a Node,
        ctx: &Value,
        env: &Env<'a>,
    ) -> Result<Val<'a>, String> {
        let (items, was_array) = match self.eval(left, ctx, env)? {
            Val::Undefined => return Ok(Val::Undefined),
            Val::Func(_) => return Err("cannot filter a function".to_string()),
            Val::Json(Value::Array(items)) => (items, true),
            Val::Json(single) => (vec![single], false),
        };

        if let Some(index) = literal_index(predicate) {
            return Ok(select_index(&items, index)
                .map(Val::Json)
                .unwrap_or(Val::Undefined));
        }

        let len = items.len();
        let mut kept = Vec::new();
        for (position, item) in items.into_iter().enumerate() {
            let keep = match self.eval(predicate, &item, env)? {
                Val::Json(Value::Number(num)) => {
                    let wanted = num.as_f64().unwrap_or(-1.0).floor();
                    let wanted = if wanted < 0.0 { wanted + len as f64 } else { wanted };
                    wanted == position as f64
                }
                other => is_true(&other),
            };
            if keep {
                kept.push(item);
            }
        }

        if was_array {
            if kept.is_empty() {
                Ok(Val::Undefined)
            } else {
                Ok(Val::Json(Value::Array(kept)))
            }
        } else {
            Ok(kept.pop().map(Val::Json).unwrap_or(Val::Undefined))
        }
    }

    fn eval_binary(
        &self,
        op: BinOp,
        left: &'a Node,
        right: &'a Node,
        ctx: &Value,
        env: &Env<'a>,
    ) -> Result<Val<'a>, String> {
        match op {
            BinOp::And => {
                let result = is_true(&self.eval(left, ctx, env)?) && is_true(&self.eval(right, ctx, env)?);
                return Ok(Val::Json(Value::Bool(result)));
            }
            BinOp::Or => {
                let result = is_true(&self.eval(left, ctx, env)?) || is_true(&self.eval(right, ctx, env)?);
                return Ok(Val::Json(Value::Bool(result)));
            }
            _ => {}
        }

        let lhs = self.eval(left, ctx, env)?;
        let rhs = self.eval(right, ctx, env)?;

        match op {
            BinOp::Concat => {
                let text = format!("{}{}", stringify(&lhs)?, stringify(&rhs)?);
                Ok(Val::Json(Value::String(text)))
            }
            BinOp::Add | BinOp::Sub | BinOp::Mul | BinOp::Div | BinOp::Mod => {
                let (a, b) = match (lhs, rhs) {
                    (Val::Undefined, _) | (_, Val::Undefined) => return Ok(Val::Undefined),
                    (Val::Json(Value::Number(a)), Val::Json(Value::Number(b))) => {
                        (a.as_f64().unwrap_or(0.0), b.as_f64().unwrap_or(0.0))
                    }
                    _ => return Err(format!("operands of '{}' must be numbers", op.symbol())),
                };
                let result = match op {
                    BinOp::Add => a + b,
                    BinOp::Sub => a - b,
                    BinOp::Mul => a * b,
                    BinOp::Div => a / b,
                    _ => a % b,
                };
                number_value(result)
                    .map(Val::Json)
                    .ok_or_else(|| format!("'{}' produced a non-finite number", op.symbol()))
            }
            BinOp::Eq | BinOp::NotEq => {
                let (Val::Json(a), Val::Json(b)) = (&lhs, &rhs) else {
                    return Ok(Val::Json(Value::Bool(false)));
                };
                let equal = values_equal(a, b);
                Ok(Val::Json(Value::Bool(if op == BinOp::Eq { equal } else { !equal })))
            }
            BinOp::Lt | BinOp::LtEq | BinOp::Gt | BinOp::GtEq => {
                let (Val::Json(a), Val::Json(b)) = (&lhs, &rhs) else {
                    return Ok(Val::Json(Value::Bool(false)));
                };
                let ordering = match (a, b) {
                    (Value::Number(a), Value::Number(b)) => a
                        .as_f64()
                        .unwrap_or(0.0)
                        .partial_cmp(&b.as_f64().unwrap_or(0.0)),
                    (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
                    _ => {
                        return Err(format!(
                            "operands of '{}' must both be numbers or both be strings",
                            op.symbol()
                        ))
                    }
                };
                let Some(ordering) = ordering else {
                    return Ok(Val::Json(Value::Bool(false)));
                };
                let result = match op {
                    BinOp::Lt => ordering.is_lt(),
                    BinOp::LtEq => ordering.is_le(),
                    BinOp::Gt => ordering.is_gt(),
                    _ => ordering.is_ge(),
                };
                Ok(Val::Json(Value::Bool(result)))
            }
            BinOp::In => {
                let Val::Json(needle) = lhs else {
                    return Ok(Val::Json(Value::Bool(false)));
                };
                let found = match rhs {
                    Val::Json(Value::Array(items)) => items.iter().any(|item| values_equal(item, &needle)),
                    Val::Json(single) => values_equal(&single, &needle),
                    _ => false,
                };
                Ok(Val::Json(Value::Bool(found)))
            }
            BinOp::And | BinOp::Or => unreachable!("handled above"),
        }
    }

    /// Call `callee` with already evaluated arguments.
    pub(crate) fn invoke(&self, callee: Val<'a>, args: Vec<Val<'a>>, ctx: &Value) -> Result<Val<'a>, String> {
        match callee {
            Val::Func(callable) => self.apply(&callable, args, ctx),
            Val::Undefined => Err("attempted to invoke an undefined function".to_string()),
            Val::Json(_) => Err("attempted to invoke a non-function".to_string()),
        }
    }

    pub(crate) fn apply(&self, callable: &Callable<'a>, args: Vec<Val<'a>>, ctx: &Value) -> Result<Val<'a>, String> {
        match callable {
            Callable::Builtin(name) => functions::call(self, name, args, ctx),
            Callable::Regex(re) => match args.into_iter().next() {
                Some(Val::Json(Value::String(text))) => Ok(first_match(re, &text)),
                _ => Ok(Val::Undefined),
            },
            Callable::Lambda { params, body, env } => {
                let scope = Frame::child(env);
                let mut args = args.into_iter();
                for param in params.iter() {
                    scope.bind(param, args.next().unwrap_or(Val::Undefined));
                }
                self.eval(*body, ctx, &scope)
            }
        }
    }
}

fn lookup_field<'a>(ctx: &Value, name: &str) -> Val<'a> {
    match ctx {
        Value::Object(map) => map.get(name).cloned().map(Val::Json).unwrap_or(Val::Undefined),
        Value::Array(items) => {
            let mut out = Vec::new();
            for item in items {
                match lookup_field(item, name) {
                    Val::Json(Value::Array(inner)) => out.extend(inner),
                    Val::Json(value) => out.push(value),
                    _ => {}
                }
            }
            if out.is_empty() {
                Val::Undefined
            } else {
                Val::Json(Value::Array(out))
            }
        }
        _ => Val::Undefined,
    }
}

fn wildcard<'a>(ctx: &Value) -> Val<'a> {
    let Value::Object(map) = ctx else {
        return Val::Undefined;
    };
    let mut out = Vec::new();
    for value in map.values() {
        match value {
            Value::Array(inner) => out.extend(inner.iter().cloned()),
            other => out.push(other.clone()),
        }
    }
    match out.len() {
        0 => Val::Undefined,
        1 => Val::Json(out.remove(0)),
        _ => Val::Json(Value::Array(out)),
    }
}

fn literal_index(predicate: &Node) -> Option<f64> {
    match predicate {
        Node::Number(num) => Some(*num),
        Node::Negate(inner) => match inner.as_ref() {
            Node::Number(num) => Some(-num),
            _ => None,
        },
        _ => None,
    }
}

fn select_index(items: &[Value], index: f64) -> Option<Value> {
    let index = index.floor();
    let index = if index < 0.0 { index + items.len() as f64 } else { index };
    if index < 0.0 {
        return None;
    }
    items.get(index as usize).cloned()
}

fn negate<'a>(num: f64) -> Result<Val<'a>, String> {
    number_value(-num)
        .map(Val::Json)
        .ok_or_else(|| "negation produced a non-finite number".to_string())
}

pub(crate) fn first_match<'a>(re: &Regex, text: &str) -> Val<'a> {
    re.captures(text)
        .map(|caps| Val::Json(match_object(&caps)))
        .unwrap_or(Val::Undefined)
}

pub(crate) fn match_object(caps: &regex::Captures<'_>) -> Value {
    let whole = caps.get(0);
    let groups = caps
        .iter()
        .skip(1)
        .map(|group| Value::String(group.map(|m| m.as_str().to_string()).unwrap_or_default()))
        .collect();
    let mut map = Map::new();
    map.insert(
        "match".to_string(),
        Value::String(whole.map(|m| m.as_str().to_string()).unwrap_or_default()),
    );
    map.insert(
        "index".to_string(),
        Value::from(whole.map(|m| m.start()).unwrap_or(0)),
    );
    map.insert("groups".to_string(), Value::Array(groups));
    Value::Object(map)
}

/// Boolean reading of a result: arrays are true when any member is true.
pub(crate) fn is_true(value: &Val<'_>) -> bool {
    match value {
        Val::Undefined => false,
        Val::Func(_) => true,
        Val::Json(value) => json_true(value),
    }
}

fn json_true(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(flag) => *flag,
        Value::Number(num) => num.as_f64().map_or(false, |f| f != 0.0),
        Value::String(text) => !text.is_empty(),
        Value::Array(items) => items.iter().any(json_true),
        Value::Object(map) => !map.is_empty(),
    }
}

/// String form used by `&` and `$string`: strings stay raw, undefined is empty.
pub(crate) fn stringify(value: &Val<'_>) -> Result<String, String> {
    match value {
        Val::Undefined => Ok(String::new()),
        Val::Json(Value::String(text)) => Ok(text.clone()),
        Val::Json(other) => Ok(other.to_string()),
        Val::Func(_) => Err("cannot convert a function to a string".to_string()),
    }
}

pub(crate) fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(a), Value::Number(b)) => a.as_f64() == b.as_f64(),
        (Value::Array(a), Value::Array(b)) => {
            a.len() == b.len() && a.iter().zip(b).all(|(x, y)| values_equal(x, y))
        }
        (Value::Object(a), Value::Object(b)) => {
            a.len() == b.len()
                && a.iter()
                    .all(|(key, x)| b.get(key).is_some_and(|y| values_equal(x, y)))
        }
        _ => a == b,
    }
}
