use std::collections::HashSet;

use axum::http::HeaderMap;
use axum::http::header;

/// Hop-by-hop headers per RFC 9110 §7.6.1, plus `Expect`. Forwarding
/// `Expect: 100-continue` or `Keep-Alive` to the engine makes its HTTP
/// stack stall or fail opaquely on POST bodies, so these describe the
/// browser-to-proxy connection only and never cross it.
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "expect",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Platform-side headers that must never reach the engine: the session
/// credential is replaced by the engine credential, and the transport
/// headers are re-derived for the outgoing request.
const PLATFORM_ONLY: &[&str] = &[
    "accept-encoding",
    "authorization",
    "content-length",
    "cookie",
    "host",
];

/// Produce the header set safe to forward to the engine. Anything named
/// by an inbound `Connection` header is treated as hop-by-hop too.
pub fn sanitize_forward_headers(inbound: &HeaderMap) -> HeaderMap {
    let mut connection_named: HashSet<String> = HashSet::new();
    for value in inbound.get_all(header::CONNECTION) {
        let Ok(value) = value.to_str() else {
            continue;
        };
        for name in value.split(',') {
            let name = name.trim().to_ascii_lowercase();
            if !name.is_empty() {
                connection_named.insert(name);
            }
        }
    }

    let mut out = HeaderMap::new();
    for (name, value) in inbound {
        let lower = name.as_str();
        if HOP_BY_HOP.contains(&lower)
            || PLATFORM_ONLY.contains(&lower)
            || connection_named.contains(lower)
        {
            continue;
        }
        out.append(name.clone(), value.clone());
    }

    out
}
