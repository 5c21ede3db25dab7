//! Datastore endpoint strings.

/// The driver name an endpoint asks for: its URL scheme, lower-cased, with
/// `postgresql` folded into `postgres`. `None` for an empty endpoint.
pub fn scheme(endpoint: &str) -> Option<String> {
    let endpoint = endpoint.trim();
    if endpoint.is_empty() {
        return None;
    }

    let scheme = match endpoint.split_once("://") {
        Some((scheme, _)) => scheme,
        None => endpoint
            .split_once(':')
            .map(|(scheme, _)| scheme)
            .unwrap_or(endpoint),
    };

    let scheme = scheme.to_ascii_lowercase();
    Some(match scheme.as_str() {
        "postgresql" => "postgres".to_string(),
        _ => scheme,
    })
}

/// Endpoint with any password replaced, safe for logs.
pub fn redact(endpoint: &str) -> String {
    let Some((scheme, rest)) = endpoint.split_once("://") else {
        return endpoint.to_string();
    };
    // userinfo ends at the last '@' of the authority
    let authority_end = rest.find(['/', '?', '#']).unwrap_or(rest.len());
    let Some((userinfo, host)) = rest[..authority_end].rsplit_once('@') else {
        return endpoint.to_string();
    };
    let tail = &rest[authority_end..];
    match userinfo.split_once(':') {
        Some((user, _)) => format!("{scheme}://{user}:***@{host}{tail}"),
        None => endpoint.to_string(),
    }
}
