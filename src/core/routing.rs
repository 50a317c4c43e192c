//! Routing key construction shared by the duplicator and the sync worker.
//!
//! Both sides derive node addresses from the short hostname, so they agree on
//! queue names without any registry beyond the configured node list.

/// Leading label of a hostname or FQDN.
pub fn short_hostname(hostname: &str) -> &str {
    hostname.split('.').next().unwrap_or(hostname)
}

/// Routing key of the central broadcast queue, e.g. `notifications.info`.
pub fn central_routing_key(topic: &str) -> String {
    format!("{topic}.info")
}

/// Routing key addressing one node, e.g. `glance_image_sync.node1.info`.
pub fn node_routing_key(relay_prefix: &str, hostname: &str) -> String {
    format!("{relay_prefix}.{}.info", short_hostname(hostname))
}
