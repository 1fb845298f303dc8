use crate::template::{body_references, collect_references, has_tokens, parse_reference, scan, Segment};
use std::collections::{BTreeSet, HashMap};
use weftcore::{Value, WorkflowContext};

/// Substitutes `{{ reference }}` tokens against an execution context.
///
/// A reference is looked up, in order, as an exact variable name, as
/// `step_id.path` into a completed step's output, and as `name.path` into an
/// object-valued variable. Anything else stays as the original token text.
/// Substituted text that contains tokens again is re-resolved up to
/// `max_depth` times; past that the original top-level token is kept.
#[derive(Debug, Clone)]
pub struct VariableResolver {
    max_depth: usize,
}

/// Raised inside one top-level token when its substitution chain is too deep.
struct DepthExceeded;

impl VariableResolver {
    pub fn new(max_depth: usize) -> Self {
        Self { max_depth }
    }

    pub fn max_depth(&self) -> usize {
        self.max_depth
    }

    pub fn resolve(&self, value: &Value, ctx: &WorkflowContext) -> Value {
        self.resolve_reporting(value, ctx).0
    }

    pub fn resolve_str(&self, text: &str, ctx: &WorkflowContext) -> String {
        let mut unresolved = BTreeSet::new();
        self.resolve_string(text, ctx, &mut unresolved)
    }

    /// Resolve `value` and return the reference names of tokens in the
    /// original value that could not be filled. Tokens that only appear
    /// inside substituted values are data and are not reported.
    pub fn resolve_reporting(&self, value: &Value, ctx: &WorkflowContext) -> (Value, BTreeSet<String>) {
        let mut unresolved = BTreeSet::new();
        let resolved = self.resolve_value(value, ctx, &mut unresolved);
        (resolved, unresolved)
    }

    /// Resolve every top-level entry of a parameter map, keeping the
    /// unresolved names per key.
    pub fn resolve_parameters(
        &self,
        parameters: &HashMap<String, Value>,
        ctx: &WorkflowContext,
    ) -> (HashMap<String, Value>, HashMap<String, BTreeSet<String>>) {
        let mut resolved = HashMap::with_capacity(parameters.len());
        let mut missing = HashMap::new();
        for (key, value) in parameters {
            let (value, unresolved) = self.resolve_reporting(value, ctx);
            if !unresolved.is_empty() {
                missing.insert(key.clone(), unresolved);
            }
            resolved.insert(key.clone(), value);
        }
        (resolved, missing)
    }

    fn resolve_value(&self, value: &Value, ctx: &WorkflowContext, unresolved: &mut BTreeSet<String>) -> Value {
        match value {
            Value::String(s) => Value::String(self.resolve_string(s, ctx, unresolved)),
            Value::Array(items) => Value::Array(
                items
                    .iter()
                    .map(|item| self.resolve_value(item, ctx, unresolved))
                    .collect(),
            ),
            Value::Object(map) => Value::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), self.resolve_value(v, ctx, unresolved)))
                    .collect(),
            ),
            other => other.clone(),
        }
    }

    fn resolve_string(&self, text: &str, ctx: &WorkflowContext, unresolved: &mut BTreeSet<String>) -> String {
        if !has_tokens(text) {
            return text.to_string();
        }
        let mut out = String::with_capacity(text.len());
        for segment in scan(text) {
            match segment {
                Segment::Text(t) => out.push_str(t),
                Segment::Token { raw, body } => match self.resolve_token(body, ctx, 0) {
                    Ok(Some(value)) => out.push_str(&value),
                    Ok(None) | Err(DepthExceeded) => {
                        out.push_str(raw);
                        unresolved.extend(body_references(body));
                    }
                },
            }
        }
        out
    }

    /// Resolve text found below the top level. Unfilled tokens stay verbatim
    /// and are reported through the returned flag.
    fn resolve_nested_text(&self, text: &str, ctx: &WorkflowContext, depth: usize) -> Result<(String, bool), DepthExceeded> {
        let mut out = String::with_capacity(text.len());
        let mut complete = true;
        for segment in scan(text) {
            match segment {
                Segment::Text(t) => out.push_str(t),
                Segment::Token { raw, body } => match self.resolve_token(body, ctx, depth)? {
                    Some(value) => out.push_str(&value),
                    None => {
                        out.push_str(raw);
                        complete = false;
                    }
                },
            }
        }
        Ok((out, complete))
    }

    fn resolve_token(&self, body: &str, ctx: &WorkflowContext, depth: usize) -> Result<Option<String>, DepthExceeded> {
        let body = body.trim();

        if parse_reference(body).is_some() {
            return match lookup(body, ctx) {
                Some(value) => self.expand(value, ctx, depth).map(Some),
                None => Ok(None),
            };
        }

        // `{{ {{inner}} }}`: the inner text names what to look up.
        let (name, complete) = self.resolve_nested_text(body, ctx, depth)?;
        if !complete {
            return Ok(None);
        }
        let name = name.trim();
        match parse_reference(name).and_then(|_| lookup(name, ctx)) {
            Some(value) => self.expand(value, ctx, depth).map(Some),
            None => Ok(Some(name.to_string())),
        }
    }

    /// Canonical text of `value`, re-resolved if it carries tokens itself.
    fn expand(&self, value: &Value, ctx: &WorkflowContext, depth: usize) -> Result<String, DepthExceeded> {
        let text = value.to_template_string();
        if !has_tokens(&text) {
            return Ok(text);
        }
        if depth + 1 > self.max_depth {
            return Err(DepthExceeded);
        }
        self.resolve_nested_text(&text, ctx, depth + 1).map(|(out, _)| out)
    }
}

impl Default for VariableResolver {
    fn default() -> Self {
        Self::new(5)
    }
}

fn lookup<'a>(name: &str, ctx: &'a WorkflowContext) -> Option<&'a Value> {
    if let Some(value) = ctx.variables.get(name) {
        return Some(value);
    }
    let segments = parse_reference(name)?;
    let (head, path) = segments.split_first()?;
    if path.is_empty() {
        return None;
    }
    ctx.result(head)
        .and_then(|result| result.output.get_path(path))
        .or_else(|| ctx.variables.get(*head).and_then(|value| value.get_path(path)))
}

/// Reference names of every token still present in `value`.
pub fn unresolved_references(value: &Value) -> BTreeSet<String> {
    let mut refs = Vec::new();
    collect_references(value, &mut refs);
    refs.into_iter().collect()
}
