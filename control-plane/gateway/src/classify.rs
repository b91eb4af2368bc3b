use orama_config::constants::NAMESPACE_HOST_PREFIX;

/// Where an inbound request must be routed. Rules apply in order: path
/// rules first, then `Host`-based tenant and deployment routing.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RouteClass {
    /// Control-plane-only endpoint; always executes locally.
    ControlPlane,
    /// Data-plane `/v1` call, forwarded to the caller's tenant gateway.
    DataPlane,
    /// ACME challenge traffic, bypassed to the certificate collaborator.
    AcmeBypass,
    /// `ns-{name}.{base_domain}`: the namespace's dedicated gateway.
    NamespaceHost { name: String },
    /// `{subdomain}.{base_domain}`: a deployed tenant application.
    DeploymentHost { subdomain: String },
}

/// Paths that must always execute on the receiving control-plane node.
fn is_control_plane_path(path: &str) -> bool {
    path.starts_with("/v1/auth/")
        || path.starts_with("/v1/namespace/")
        || path.starts_with("/v1/internal/")
}

/// Classify a request by path and `Host` header. The `ns-` prefix is
/// reserved, so namespace hosts and deployment hosts can never collide.
#[must_use]
pub fn classify(path: &str, host: Option<&str>, base_domain: &str) -> RouteClass {
    if path.starts_with("/v1/") {
        if is_control_plane_path(path) {
            return RouteClass::ControlPlane;
        }
        return RouteClass::DataPlane;
    }

    if path.starts_with("/.well-known/") {
        return RouteClass::AcmeBypass;
    }

    if let Some(label) = host
        .map(strip_port)
        .and_then(|host| subdomain_label(host, base_domain))
    {
        if let Some(name) = label.strip_prefix(NAMESPACE_HOST_PREFIX) {
            return RouteClass::NamespaceHost {
                name: name.to_owned(),
            };
        }
        return RouteClass::DeploymentHost {
            subdomain: label.to_owned(),
        };
    }

    RouteClass::ControlPlane
}

fn strip_port(host: &str) -> &str {
    host.rsplit_once(':').map_or(host, |(name, _)| name)
}

/// `{label}.{base_domain}` → `label`; anything else is not a tenant host.
fn subdomain_label<'a>(host: &'a str, base_domain: &str) -> Option<&'a str> {
    let label = host.strip_suffix(base_domain)?.strip_suffix('.')?;
    (!label.is_empty() && !label.contains('.')).then_some(label)
}
