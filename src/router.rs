//! Radix-tree request router.
//!
//! Two trees per HTTP method, O(path-length) lookup. Build it once during
//! setup; after the controller is built it is only ever read, so lookups take
//! no locks.
//!
//! # Pattern syntax
//!
//! | Segment   | Matches                                 | Bound as      |
//! |-----------|-----------------------------------------|---------------|
//! | `users`   | exactly `users`                         | nothing       |
//! | `:id`     | any single non-empty segment            | `id`          |
//! | `*`       | the rest of the path, possibly empty    | `*`           |
//!
//! When several patterns could match the same path, literal beats parameter
//! beats wildcard, compared segment by segment from the left. With
//! `/files/readme`, `/files/:name` and `/files/*` registered, `/files/readme`
//! reaches the first, `/files/a` the second, and `/files/a/b` and `/files/`
//! the third.
//!
//! matchit refuses a parameter and a catch-all at the same position in one
//! tree, so patterns ending in `*` live in a tree of their own. A lookup
//! consults both and keeps the more specific match.
//!
//! Patterns are validated when registered. A wildcard anywhere but the last
//! segment, an unnamed or repeated parameter, or a pattern conflicting with
//! one already in the tree is rejected with [`Error::InvalidRoute`].

use std::collections::HashMap;

use http::Method;
use matchit::Router as MatchitRouter;

use crate::context::Params;
use crate::error::{Error, Result};
use crate::handler::{Handler, Middleware, merge};

/// Parameter name the trailing wildcard is stored under inside matchit.
/// Reported to callers as `*`.
const WILDCARD_KEY: &str = "__wildcard";

/// Outcome of [`Muxer::lookup`].
#[derive(Debug)]
pub enum Lookup {
    /// A route matched; its parameters were written to the supplied [`Params`].
    Matched(Handler),
    /// The path matches under these methods (sorted), but not the requested one.
    MethodNotAllowed(Vec<Method>),
    /// Nothing matches the path.
    NotFound,
}

/// The router contract the controller dispatches through.
///
/// [`RadixRouter`] is the default; replace it with
/// [`App::with_muxer`](crate::App::with_muxer).
pub trait Muxer: Send + Sync + 'static {
    /// Registers `handler` for `method` + `pattern`, wrapped in the
    /// route-specific `middleware`. Returns the route so it can be named.
    fn add_handler(
        &mut self,
        method: Method,
        pattern: &str,
        handler: Handler,
        middleware: &[Middleware],
    ) -> Result<&mut NamedRoute>;

    /// Adds middleware wrapping every route registered on this muxer from
    /// now on, outside the route's own middleware.
    fn use_middleware(&mut self, middleware: Middleware);

    /// Resolves a concrete request path. Bound parameters are appended to `params`.
    fn lookup(&self, method: &Method, path: &str, params: &mut Params) -> Lookup;

    /// Every registered route, in registration order.
    fn routes(&self) -> &[NamedRoute];
}

// ── NamedRoute ────────────────────────────────────────────────────────────────

/// A registered route as seen from outside the router: method, pattern and
/// an optional name for reverse URL construction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NamedRoute {
    name: String,
    method: Method,
    path: String,
}

impl NamedRoute {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self { name: String::new(), method, path: path.into() }
    }

    /// Route identity: method followed by pattern, e.g. `GET/users/:id`.
    pub fn id(&self) -> String {
        format!("{}{}", self.method, self.path)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Names the route for [`Ctx::url`](crate::Ctx::url).
    pub fn set_name(&mut self, name: impl Into<String>) -> &mut Self {
        self.name = name.into();
        self
    }

    /// Builds a concrete path, filling `:param` and `*` segments from
    /// `params` in order. Missing values become empty segments.
    pub fn url(&self, params: &[&str]) -> String {
        let mut values = params.iter();
        let mut out = String::with_capacity(self.path.len());
        for (i, seg) in self.path.split('/').enumerate() {
            if i > 0 {
                out.push('/');
            }
            if seg.starts_with(':') || seg == "*" {
                out.push_str(values.next().copied().unwrap_or(""));
            } else {
                out.push_str(seg);
            }
        }
        out
    }
}

// ── RadixRouter ───────────────────────────────────────────────────────────────

/// How specific one pattern segment is. Lower wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Rank {
    Literal,
    Param,
    Wildcard,
}

/// A tree value: the composed handler plus the rank of every segment of the
/// pattern it was registered under.
#[derive(Clone)]
struct Entry {
    handler: Handler,
    rank: Box<[Rank]>,
}

/// The two trees of one method.
#[derive(Default)]
struct Trees {
    exact: MatchitRouter<Entry>,
    wildcard: MatchitRouter<Entry>,
}

impl Trees {
    fn at<'m, 'p>(&'m self, path: &'p str) -> Option<matchit::Match<'m, 'p, &'m Entry>> {
        match (self.exact.at(path).ok(), self.wildcard.at(path).ok()) {
            (Some(exact), Some(wild)) if wild.value.rank < exact.value.rank => Some(wild),
            (Some(exact), _) => Some(exact),
            (None, wild) => wild,
        }
    }
}

/// The default [`Muxer`], backed by [`matchit`] trees per method.
#[derive(Default)]
pub struct RadixRouter {
    trees: HashMap<Method, Trees>,
    routes: Vec<NamedRoute>,
    middleware: Vec<Middleware>,
}

impl RadixRouter {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Muxer for RadixRouter {
    fn add_handler(
        &mut self,
        method: Method,
        pattern: &str,
        handler: Handler,
        middleware: &[Middleware],
    ) -> Result<&mut NamedRoute> {
        if self.routes.iter().any(|r| r.method == method && r.path == pattern) {
            return Err(Error::DuplicateRoute { method, pattern: pattern.to_owned() });
        }

        let compiled = compile(pattern)?;
        let conflict = |e: matchit::InsertError| Error::InvalidRoute {
            pattern: pattern.to_owned(),
            reason: e.to_string(),
        };
        let entry = Entry {
            handler: merge(merge(handler, middleware), &self.middleware),
            rank: compiled.rank.into_boxed_slice(),
        };

        let trees = self.trees.entry(method.clone()).or_default();
        match compiled.bare {
            None => trees.exact.insert(compiled.path, entry).map_err(conflict)?,
            Some(bare) => {
                trees.wildcard.insert(compiled.path.clone(), entry.clone()).map_err(conflict)?;
                // matchit's catch-all needs one character; the bare prefix
                // covers an empty remainder.
                if let Err(e) = trees.wildcard.insert(bare, entry) {
                    trees.wildcard.remove(compiled.path);
                    return Err(conflict(e));
                }
            }
        }

        self.routes.push(NamedRoute::new(method, pattern));
        let index = self.routes.len() - 1;
        Ok(&mut self.routes[index])
    }

    fn use_middleware(&mut self, middleware: Middleware) {
        self.middleware.push(middleware);
    }

    fn lookup(&self, method: &Method, path: &str, params: &mut Params) -> Lookup {
        if let Some(matched) = self.trees.get(method).and_then(|trees| trees.at(path)) {
            let mut remainder = false;
            for (name, value) in matched.params.iter() {
                if name == WILDCARD_KEY {
                    remainder = true;
                    params.insert("*", value);
                } else {
                    params.insert(name, value);
                }
            }
            if !remainder && matched.value.rank.last() == Some(&Rank::Wildcard) {
                params.insert("*", "");
            }
            return Lookup::Matched(matched.value.handler.clone());
        }

        // Slow path, taken only on a miss: which other methods know this path?
        let mut allowed: Vec<Method> = self
            .trees
            .iter()
            .filter(|(m, trees)| *m != method && trees.at(path).is_some())
            .map(|(m, _)| m.clone())
            .collect();

        if allowed.is_empty() {
            return Lookup::NotFound;
        }
        allowed.sort_by(|a, b| a.as_str().cmp(b.as_str()));
        Lookup::MethodNotAllowed(allowed)
    }

    fn routes(&self) -> &[NamedRoute] {
        &self.routes
    }
}

/// A pattern in matchit syntax.
#[derive(Debug, PartialEq, Eq)]
struct Compiled {
    path: String,
    rank: Vec<Rank>,
    /// For wildcard patterns, the path with the catch-all dropped.
    bare: Option<String>,
}

/// Translates a `/users/:id/*` pattern into matchit's `/users/{id}/{*…}`
/// syntax, validating it on the way.
fn compile(pattern: &str) -> Result<Compiled> {
    let invalid = |reason: &str| Error::InvalidRoute {
        pattern: pattern.to_owned(),
        reason: reason.to_owned(),
    };

    let rest = pattern
        .strip_prefix('/')
        .ok_or_else(|| invalid("pattern must start with `/`"))?;

    let mut out = String::with_capacity(pattern.len() + 8);
    let mut rank = Vec::new();
    let mut bare = None;
    let mut names: Vec<&str> = Vec::new();
    let mut segments = rest.split('/').peekable();

    while let Some(seg) = segments.next() {
        out.push('/');

        if let Some(name) = seg.strip_prefix(':') {
            if name.is_empty() {
                return Err(invalid("parameter has no name"));
            }
            if name.contains(['{', '}', ':', '*']) {
                return Err(invalid("parameter name contains a reserved character"));
            }
            if name == WILDCARD_KEY {
                return Err(invalid("parameter name is reserved"));
            }
            if names.contains(&name) {
                return Err(invalid("parameter name appears twice"));
            }
            names.push(name);
            rank.push(Rank::Param);
            out.push('{');
            out.push_str(name);
            out.push('}');
        } else if let Some(name) = seg.strip_prefix('*') {
            if !name.is_empty() {
                return Err(invalid("wildcard cannot be named; it binds as `*`"));
            }
            if segments.peek().is_some() {
                return Err(invalid("wildcard must be the last segment"));
            }
            rank.push(Rank::Wildcard);
            bare = Some(out.clone());
            out.push_str("{*");
            out.push_str(WILDCARD_KEY);
            out.push('}');
        } else {
            rank.push(Rank::Literal);
            // Literal braces must be doubled for matchit.
            out.push_str(&seg.replace('{', "{{").replace('}', "}}"));
        }
    }

    Ok(Compiled { path: out, rank, bare })
}
