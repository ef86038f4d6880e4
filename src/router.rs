// src/router.rs
use crate::error::{UvhttpError, UvhttpResult};
use crate::http::{Context, Method, Response};
use arrayvec::ArrayVec;

pub type Handler = fn(&mut Context, &mut Response);

pub const MAX_PARAMS: usize = 8;
/// Route count above which the flat array is promoted to the trie.
pub const HYBRID_THRESHOLD: usize = 100;
/// Literal fan-out per trie node; denser nodes chain into overflow blocks.
const TRIE_FANOUT: usize = 12;

/// Captured `:name` / `*name` values. Names borrow from the router,
/// values from the request path; nothing is copied.
pub type Params<'a> = ArrayVec<(&'a str, &'a str), MAX_PARAMS>;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Param(String),
    Wildcard(String),
}

impl Segment {
    fn class(&self) -> u8 {
        match self {
            Segment::Literal(_) => 0,
            Segment::Param(_) => 1,
            Segment::Wildcard(_) => 2,
        }
    }
}

struct Route {
    method: Method,
    segments: Vec<Segment>,
    handler: Handler,
    index: u32,
}

impl Route {
    fn is_literal(&self) -> bool {
        self.segments.iter().all(|s| matches!(s, Segment::Literal(_)))
    }
}

fn parse_pattern(pattern: &str) -> UvhttpResult<Vec<Segment>> {
    if !pattern.starts_with('/') {
        return Err(UvhttpError::InvalidParam("route pattern must start with '/'"));
    }
    let mut segments = Vec::new();
    let parts: Vec<&str> = pattern.split('/').filter(|s| !s.is_empty()).collect();
    for (i, part) in parts.iter().enumerate() {
        let seg = if let Some(name) = part.strip_prefix(':') {
            if name.is_empty() {
                return Err(UvhttpError::InvalidParam("':' segment requires a name"));
            }
            Segment::Param(name.to_string())
        } else if let Some(name) = part.strip_prefix('*') {
            if name.is_empty() {
                return Err(UvhttpError::InvalidParam("'*' segment requires a name"));
            }
            if i != parts.len() - 1 {
                return Err(UvhttpError::InvalidParam("'*' segment must be terminal"));
            }
            Segment::Wildcard(name.to_string())
        } else {
            Segment::Literal(part.to_string())
        };
        segments.push(seg);
    }
    Ok(segments)
}

/// Path split into segments with byte offsets into the original path, so
/// wildcard captures can reference the remaining path without copying.
fn split_path(path: &str) -> Vec<(usize, &str)> {
    let mut out = Vec::new();
    let mut offset = 0;
    for part in path.split('/') {
        if !part.is_empty() {
            out.push((offset, part));
        }
        offset += part.len() + 1;
    }
    out
}

/// Two patterns that overlap structurally must agree on capture names, so
/// the flat array and the trie (which shares param nodes) stay
/// observationally identical.
fn check_name_conflicts(existing: &[Segment], new: &[Segment]) -> UvhttpResult<()> {
    for (a, b) in existing.iter().zip(new) {
        match (a, b) {
            (Segment::Literal(x), Segment::Literal(y)) => {
                if x != y {
                    return Ok(());
                }
            }
            (Segment::Param(x), Segment::Param(y)) => {
                if x != y {
                    return Err(UvhttpError::InvalidParam(
                        "conflicting parameter name for overlapping routes",
                    ));
                }
            }
            (Segment::Wildcard(x), Segment::Wildcard(y)) => {
                if x != y {
                    return Err(UvhttpError::InvalidParam(
                        "conflicting wildcard name for overlapping routes",
                    ));
                }
            }
            _ => return Ok(()),
        }
    }
    Ok(())
}

// ── Trie representation ──

struct TrieNode {
    /// Literal segment text, or the capture name for param/wildcard nodes.
    key: String,
    /// Literal children, ordered by first byte within the block.
    children: ArrayVec<u32, TRIE_FANOUT>,
    /// Continuation block when more than `TRIE_FANOUT` literal children exist.
    overflow: Option<u32>,
    param: Option<u32>,
    wildcard: Option<u32>,
    /// (method, handler, insertion index) terminals at this node.
    terminals: Vec<(Method, Handler, u32)>,
}

impl TrieNode {
    fn new(key: String) -> Self {
        Self {
            key,
            children: ArrayVec::new(),
            overflow: None,
            param: None,
            wildcard: None,
            terminals: Vec::new(),
        }
    }
}

/// Arena-allocated compressed trie: nodes addressed by index, never by
/// pointer, so insertion cannot invalidate links.
struct Trie {
    nodes: Vec<TrieNode>,
}

impl Trie {
    fn new() -> Self {
        Self {
            nodes: vec![TrieNode::new(String::new())],
        }
    }

    fn alloc(&mut self, key: String) -> u32 {
        let idx = self.nodes.len() as u32;
        self.nodes.push(TrieNode::new(key));
        idx
    }

    /// Find or insert the literal child `seg` of `node`, following
    /// overflow blocks and keeping each block ordered by first byte.
    fn literal_child(&mut self, mut node: u32, seg: &str) -> u32 {
        loop {
            for &child in &self.nodes[node as usize].children {
                if self.nodes[child as usize].key == seg {
                    return child;
                }
            }
            match self.nodes[node as usize].overflow {
                Some(next) => node = next,
                None => break,
            }
        }
        // Not present: insert into the first block with room.
        let child = self.alloc(seg.to_string());
        let mut block = node;
        loop {
            if self.nodes[block as usize].children.len() < TRIE_FANOUT {
                let first = seg.as_bytes().first().copied().unwrap_or(0);
                let pos = self.nodes[block as usize]
                    .children
                    .iter()
                    .position(|&c| {
                        self.nodes[c as usize].key.as_bytes().first().copied().unwrap_or(0) > first
                    })
                    .unwrap_or(self.nodes[block as usize].children.len());
                self.nodes[block as usize].children.insert(pos, child);
                return child;
            }
            match self.nodes[block as usize].overflow {
                Some(next) => block = next,
                None => {
                    let cont = self.alloc(String::new());
                    self.nodes[block as usize].overflow = Some(cont);
                    block = cont;
                }
            }
        }
    }

    fn insert(&mut self, route: &Route) -> UvhttpResult<()> {
        let mut node = 0u32;
        for seg in &route.segments {
            node = match seg {
                Segment::Literal(text) => self.literal_child(node, text),
                Segment::Param(name) => match self.nodes[node as usize].param {
                    Some(child) => {
                        if self.nodes[child as usize].key != *name {
                            return Err(UvhttpError::InvalidParam(
                                "conflicting parameter name for overlapping routes",
                            ));
                        }
                        child
                    }
                    None => {
                        let child = self.alloc(name.clone());
                        self.nodes[node as usize].param = Some(child);
                        child
                    }
                },
                Segment::Wildcard(name) => match self.nodes[node as usize].wildcard {
                    Some(child) => {
                        if self.nodes[child as usize].key != *name {
                            return Err(UvhttpError::InvalidParam(
                                "conflicting wildcard name for overlapping routes",
                            ));
                        }
                        child
                    }
                    None => {
                        let child = self.alloc(name.clone());
                        self.nodes[node as usize].wildcard = Some(child);
                        child
                    }
                },
            };
        }
        let terminals = &mut self.nodes[node as usize].terminals;
        if terminals.iter().any(|(m, _, _)| *m == route.method) {
            return Err(UvhttpError::InvalidParam("duplicate route"));
        }
        terminals.push((route.method, route.handler, route.index));
        Ok(())
    }

    fn find<'a>(
        &'a self,
        segments: &[(usize, &'a str)],
        path: &'a str,
        method: Method,
    ) -> Option<(Handler, Params<'a>)> {
        let mut params = Params::new();
        self.walk(0, segments, 0, path, method, &mut params)
            .map(|h| (h, params))
    }

    fn terminal(&self, node: u32, method: Method) -> Option<Handler> {
        // Ties between an exact-method route and an ANY route break by
        // insertion order.
        self.nodes[node as usize]
            .terminals
            .iter()
            .filter(|(m, _, _)| *m == method || *m == Method::Any)
            .min_by_key(|(_, _, idx)| *idx)
            .map(|(_, h, _)| *h)
    }

    fn walk<'a>(
        &'a self,
        node: u32,
        segments: &[(usize, &'a str)],
        depth: usize,
        path: &'a str,
        method: Method,
        params: &mut Params<'a>,
    ) -> Option<Handler> {
        if depth == segments.len() {
            if let Some(h) = self.terminal(node, method) {
                return Some(h);
            }
            // A trailing wildcard matches the empty remainder.
            if let Some(wc) = self.nodes[node as usize].wildcard {
                if let Some(h) = self.terminal(wc, method) {
                    if params.len() < MAX_PARAMS {
                        params.push((self.nodes[wc as usize].key.as_str(), ""));
                    }
                    return Some(h);
                }
            }
            return None;
        }

        let (offset, seg) = segments[depth];

        // Literal children first, across overflow blocks.
        let mut block = node;
        loop {
            for &child in &self.nodes[block as usize].children {
                if self.nodes[child as usize].key == seg {
                    if let Some(h) = self.walk(child, segments, depth + 1, path, method, params) {
                        return Some(h);
                    }
                }
            }
            match self.nodes[block as usize].overflow {
                Some(next) => block = next,
                None => break,
            }
        }

        // Then the parameter slot, with backtracking.
        if let Some(child) = self.nodes[node as usize].param {
            let before = params.len();
            if params.len() < MAX_PARAMS {
                params.push((self.nodes[child as usize].key.as_str(), seg));
            }
            if let Some(h) = self.walk(child, segments, depth + 1, path, method, params) {
                return Some(h);
            }
            params.truncate(before);
        }

        // Finally the wildcard slot, consuming the rest of the path.
        if let Some(child) = self.nodes[node as usize].wildcard {
            if let Some(h) = self.terminal(child, method) {
                if params.len() < MAX_PARAMS {
                    params.push((self.nodes[child as usize].key.as_str(), &path[offset..]));
                }
                return Some(h);
            }
        }

        None
    }
}

// ── Router ──

enum Repr {
    Array(Vec<Route>),
    Trie(Trie),
}

/// Hybrid route table.
///
/// Small tables stay a flat array scanned linearly (two passes: literal
/// routes first, then parameterized). The add that crosses
/// `HYBRID_THRESHOLD` promotes everything into the trie in one step; the
/// array is discarded and later adds go straight to the trie. Both
/// representations answer lookups identically.
pub struct Router {
    repr: Repr,
    count: usize,
    next_index: u32,
}

impl Router {
    pub fn new() -> Self {
        Self {
            repr: Repr::Array(Vec::new()),
            count: 0,
            next_index: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// True while the flat-array representation is authoritative.
    pub fn is_array(&self) -> bool {
        matches!(self.repr, Repr::Array(_))
    }

    /// Register a route. Rejects malformed patterns and duplicate
    /// `(method, pattern)` pairs.
    pub fn add(&mut self, method: Method, pattern: &str, handler: Handler) -> UvhttpResult<()> {
        if method == Method::Unknown {
            return Err(UvhttpError::InvalidParam("cannot route UNKNOWN method"));
        }
        let segments = parse_pattern(pattern)?;
        let route = Route {
            method,
            segments,
            handler,
            index: self.next_index,
        };

        match &mut self.repr {
            Repr::Array(routes) => {
                if routes
                    .iter()
                    .any(|r| r.method == method && r.segments == route.segments)
                {
                    return Err(UvhttpError::InvalidParam("duplicate route"));
                }
                for r in routes.iter() {
                    check_name_conflicts(&r.segments, &route.segments)?;
                }
                routes.push(route);
                self.count += 1;
                self.next_index += 1;
                if self.count > HYBRID_THRESHOLD {
                    self.promote();
                }
            }
            Repr::Trie(trie) => {
                trie.insert(&route)?;
                self.count += 1;
                self.next_index += 1;
            }
        }
        Ok(())
    }

    /// Lift every array route into a freshly built trie and drop the
    /// array. Callers never observe a partial trie: the representation is
    /// swapped only after the build finishes.
    fn promote(&mut self) {
        let routes = match &mut self.repr {
            Repr::Array(routes) => std::mem::take(routes),
            Repr::Trie(_) => return,
        };
        let mut trie = Trie::new();
        for route in &routes {
            trie.insert(route).expect("array held no duplicates or conflicts");
        }
        self.repr = Repr::Trie(trie);
    }

    /// Find the handler for `path` + `method`, with captured parameters.
    ///
    /// Preference: exact literal > `:param` > `*wildcard` per segment;
    /// within a class the route with more literal prefix segments wins;
    /// remaining ties break by insertion order. `Method::Any` routes match
    /// every method.
    pub fn find_handler<'a>(&'a self, path: &'a str, method: Method) -> Option<(Handler, Params<'a>)> {
        let path = if path.is_empty() { "/" } else { path };
        let segments = split_path(path);
        match &self.repr {
            Repr::Array(routes) => Self::find_array(routes, &segments, path, method),
            Repr::Trie(trie) => trie.find(&segments, path, method),
        }
    }

    fn find_array<'a>(
        routes: &'a [Route],
        segments: &[(usize, &'a str)],
        path: &'a str,
        method: Method,
    ) -> Option<(Handler, Params<'a>)> {
        // Pass 1: fully-literal routes in insertion order.
        for route in routes.iter().filter(|r| r.is_literal()) {
            if route.method != method && route.method != Method::Any {
                continue;
            }
            if route.segments.len() == segments.len()
                && route
                    .segments
                    .iter()
                    .zip(segments)
                    .all(|(seg, (_, s))| matches!(seg, Segment::Literal(l) if l == s))
            {
                return Some((route.handler, Params::new()));
            }
        }

        // Pass 2: parameterized routes; the lexicographically smallest
        // per-segment class signature wins, which is exactly the order the
        // trie's literal-before-param-before-wildcard walk produces.
        let mut best: Option<(&Route, Vec<u8>)> = None;
        for route in routes.iter().filter(|r| !r.is_literal()) {
            if route.method != method && route.method != Method::Any {
                continue;
            }
            let Some(signature) = Self::match_signature(route, segments) else {
                continue;
            };
            let better = match &best {
                None => true,
                Some((_, best_sig)) => signature < *best_sig,
            };
            if better {
                best = Some((route, signature));
            }
        }
        let (route, _) = best?;
        let mut params = Params::new();
        for (seg, (offset, part)) in route.segments.iter().zip(segments) {
            match seg {
                Segment::Literal(_) => {}
                Segment::Param(name) => {
                    if params.len() < MAX_PARAMS {
                        params.push((name.as_str(), *part));
                    }
                }
                Segment::Wildcard(name) => {
                    if params.len() < MAX_PARAMS {
                        params.push((name.as_str(), &path[*offset..]));
                    }
                }
            }
        }
        if let Some(Segment::Wildcard(name)) = route.segments.last() {
            // Wildcard matching the empty remainder captured nothing above.
            if route.segments.len() == segments.len() + 1 && params.len() < MAX_PARAMS {
                params.push((name.as_str(), ""));
            }
        }
        Some((route.handler, params))
    }

    /// Per-segment class signature of a successful match, or None.
    fn match_signature(route: &Route, segments: &[(usize, &str)]) -> Option<Vec<u8>> {
        let mut signature = Vec::with_capacity(route.segments.len());
        let mut i = 0;
        for seg in &route.segments {
            match seg {
                Segment::Wildcard(_) => {
                    // Matches the remainder, including empty.
                    signature.push(seg.class());
                    return Some(signature);
                }
                Segment::Literal(text) => {
                    let (_, part) = segments.get(i)?;
                    if text != part {
                        return None;
                    }
                    signature.push(seg.class());
                    i += 1;
                }
                Segment::Param(_) => {
                    segments.get(i)?;
                    signature.push(seg.class());
                    i += 1;
                }
            }
        }
        if i == segments.len() { Some(signature) } else { None }
    }

    // Convenience registration methods.

    pub fn get(&mut self, path: &str, handler: Handler) -> UvhttpResult<()> {
        self.add(Method::Get, path, handler)
    }
    pub fn post(&mut self, path: &str, handler: Handler) -> UvhttpResult<()> {
        self.add(Method::Post, path, handler)
    }
    pub fn put(&mut self, path: &str, handler: Handler) -> UvhttpResult<()> {
        self.add(Method::Put, path, handler)
    }
    pub fn delete(&mut self, path: &str, handler: Handler) -> UvhttpResult<()> {
        self.add(Method::Delete, path, handler)
    }
    pub fn patch(&mut self, path: &str, handler: Handler) -> UvhttpResult<()> {
        self.add(Method::Patch, path, handler)
    }
    pub fn head(&mut self, path: &str, handler: Handler) -> UvhttpResult<()> {
        self.add(Method::Head, path, handler)
    }
    pub fn options(&mut self, path: &str, handler: Handler) -> UvhttpResult<()> {
        self.add(Method::Options, path, handler)
    }
    pub fn any(&mut self, path: &str, handler: Handler) -> UvhttpResult<()> {
        self.add(Method::Any, path, handler)
    }
}

impl Default for Router {
    fn default() -> Self {
        Self::new()
    }
}
