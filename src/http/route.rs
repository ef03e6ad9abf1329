//! Ordered route/controller registry.
//!
//! Pattern grammar: a literal segment matches verbatim, `?` matches exactly
//! one path segment, and a trailing `*` matches the remainder of the path
//! (one or more segments, may be empty). When more than one registered route
//! matches a request, the one with the most literal segments wins; among
//! routes tied on literal-segment count, one using `?` beats one using `*`;
//! remaining ties are broken by registration order (earliest wins).

use crate::http::method::{HttpMethod, MethodMask};
use crate::http::request::HttpRequest;

/// What a controller hands back; the processor builds the wire response
/// (status line, terminal headers, `Content-Length` patch) from this.
pub struct RouteResponse {
    pub status: u16,
    pub content_type: String,
    pub body: Vec<u8>,
}

impl RouteResponse {
    pub fn new(status: u16, content_type: impl Into<String>, body: Vec<u8>) -> Self {
        Self {
            status,
            content_type: content_type.into(),
            body,
        }
    }
}

/// A registered route's handler. Takes the parsed request and the raw
/// `recv_buf` bytes it was parsed from (needed to materialize the request's
/// offset-based slices).
pub type Controller = Box<dyn Fn(&HttpRequest, &[u8]) -> RouteResponse + Send + Sync>;

enum Segment {
    Literal(String),
    Single,
    Wildcard,
}

pub struct Route {
    segments: Vec<Segment>,
    method_mask: MethodMask,
    resp_content_type: String,
    controller: Controller,
}

impl Route {
    pub fn resp_content_type(&self) -> &str {
        &self.resp_content_type
    }

    pub fn call(&self, request: &HttpRequest, recv_buf: &[u8]) -> RouteResponse {
        (self.controller)(request, recv_buf)
    }
}

#[derive(Default)]
pub struct Router {
    routes: Vec<Route>,
}

impl Router {
    pub fn new() -> Self {
        Self { routes: Vec::new() }
    }

    pub fn register(
        &mut self,
        pattern: &str,
        method_mask: MethodMask,
        resp_content_type: impl Into<String>,
        controller: Controller,
    ) {
        self.routes.push(Route {
            segments: parse_pattern(pattern),
            method_mask,
            resp_content_type: resp_content_type.into(),
            controller,
        });
    }

    /// Returns the best-matching route for `path`/`method`, if any.
    pub fn find(&self, path: &str, method: HttpMethod) -> Option<&Route> {
        let path_segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();

        let mut best_key: Option<(usize, usize, usize)> = None;
        let mut best_route = None;
        for (idx, route) in self.routes.iter().enumerate() {
            if !route.method_mask.matches(method) {
                continue;
            }
            let Some((literal, single)) = match_score(&route.segments, &path_segments) else {
                continue;
            };
            let key = (literal, single, usize::MAX - idx);
            if best_key.map_or(true, |b| key > b) {
                best_key = Some(key);
                best_route = Some(route);
            }
        }
        best_route
    }
}

fn parse_pattern(pattern: &str) -> Vec<Segment> {
    pattern
        .split('/')
        .filter(|s| !s.is_empty())
        .map(|s| match s {
            "?" => Segment::Single,
            "*" => Segment::Wildcard,
            literal => Segment::Literal(literal.to_string()),
        })
        .collect()
}

/// `(literal_matches, single_segment_matches)` if `segments` matches `path`,
/// both components compared lexicographically to rank candidates — higher
/// is better on each.
fn match_score(segments: &[Segment], path: &[&str]) -> Option<(usize, usize)> {
    let mut literal = 0;
    let mut single = 0;
    let mut pi = 0;

    for (i, seg) in segments.iter().enumerate() {
        match seg {
            Segment::Literal(lit) => {
                if pi >= path.len() || path[pi] != lit.as_str() {
                    return None;
                }
                literal += 1;
                pi += 1;
            }
            Segment::Single => {
                if pi >= path.len() {
                    return None;
                }
                single += 1;
                pi += 1;
            }
            Segment::Wildcard => {
                if i != segments.len() - 1 || pi > path.len() {
                    return None;
                }
                return Some((literal, single));
            }
        }
    }

    (pi == path.len()).then_some((literal, single))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ok_controller() -> Controller {
        Box::new(|_req, _buf| RouteResponse::new(200, "text/plain", b"ok".to_vec()))
    }

    #[test]
    fn literal_beats_wildcard_on_more_segments() {
        let mut router = Router::new();
        router.register("/users/*", MethodMask::ANY, "text/plain", ok_controller());
        router.register("/users/me", MethodMask::ANY, "text/plain", ok_controller());

        let route = router.find("/users/me", HttpMethod::Get).unwrap();
        assert_eq!(route.resp_content_type(), "text/plain");
    }

    #[test]
    fn single_beats_wildcard_on_tie() {
        let mut router = Router::new();
        router.register("/items/*", MethodMask::ANY, "a", ok_controller());
        router.register("/items/?", MethodMask::ANY, "b", ok_controller());

        let route = router.find("/items/42", HttpMethod::Get).unwrap();
        assert_eq!(route.resp_content_type(), "b");
    }

    #[test]
    fn earliest_registration_wins_remaining_ties() {
        let mut router = Router::new();
        router.register("/items/?", MethodMask::ANY, "first", ok_controller());
        router.register("/items/?", MethodMask::ANY, "second", ok_controller());

        let route = router.find("/items/42", HttpMethod::Get).unwrap();
        assert_eq!(route.resp_content_type(), "first");
    }

    #[test]
    fn method_mask_filters_candidates() {
        let mut router = Router::new();
        router.register(
            "/items",
            MethodMask::of(HttpMethod::Post),
            "a",
            ok_controller(),
        );
        assert!(router.find("/items", HttpMethod::Get).is_none());
        assert!(router.find("/items", HttpMethod::Post).is_some());
    }

    #[test]
    fn wildcard_matches_empty_remainder() {
        let mut router = Router::new();
        router.register("/files/*", MethodMask::ANY, "a", ok_controller());
        assert!(router.find("/files", HttpMethod::Get).is_some());
        assert!(router.find("/files/a/b/c", HttpMethod::Get).is_some());
    }

    #[test]
    fn no_match_returns_none() {
        let router = Router::new();
        assert!(router.find("/nope", HttpMethod::Get).is_none());
    }
}
