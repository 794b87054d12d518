//! libvirt XML documents rendered from handlebars templates.
//!
//! Templates live under `templates/` and are compiled into the binary.
//! Handlebars escapes every interpolated value, so names and paths taken
//! from configuration cannot break out of an attribute or element.

use std::fmt::Display;

use handlebars::Handlebars;
use serde_json::{json, Value};

use crate::hypervisor::traits::{
    DomainSpec, DomainTemplate, ForwardMode, HypervisorError, NetworkSpec, PoolSpec, VolumeSource,
    VolumeSpec,
};

const DOMAIN_DEVICES_PARTIAL: &str = include_str!("../../../templates/domain-devices.xml.hbs");

const TEMPLATES: [(&str, &str); 6] = [
    (
        "domain_controller",
        include_str!("../../../templates/domain-controller.xml.hbs"),
    ),
    (
        "domain_compute",
        include_str!("../../../templates/domain-compute.xml.hbs"),
    ),
    (
        "domain_worker",
        include_str!("../../../templates/domain-worker.xml.hbs"),
    ),
    ("network", include_str!("../../../templates/network.xml.hbs")),
    ("pool", include_str!("../../../templates/pool.xml.hbs")),
    ("volume", include_str!("../../../templates/volume.xml.hbs")),
];

fn render_error(document: &str, e: impl Display) -> HypervisorError {
    HypervisorError::Render {
        document: document.to_string(),
        message: e.to_string(),
    }
}

fn registry() -> Result<Handlebars<'static>, HypervisorError> {
    let mut handlebars = Handlebars::new();
    handlebars.set_strict_mode(true);
    handlebars
        .register_partial("domain_devices", DOMAIN_DEVICES_PARTIAL)
        .map_err(|e| render_error("domain_devices", e))?;
    for (name, source) in TEMPLATES {
        handlebars
            .register_template_string(name, source)
            .map_err(|e| render_error(name, e))?;
    }
    Ok(handlebars)
}

fn render(template: &str, context: &Value) -> Result<String, HypervisorError> {
    registry()?
        .render(template, context)
        .map_err(|e| render_error(template, e))
}

/// Registered template backing a domain role.
pub(crate) fn domain_template_name(template: DomainTemplate) -> &'static str {
    match template {
        DomainTemplate::Controller => "domain_controller",
        DomainTemplate::Compute => "domain_compute",
        DomainTemplate::Worker => "domain_worker",
    }
}

pub(crate) fn domain(spec: &DomainSpec) -> Result<String, HypervisorError> {
    let hostdevs: Vec<Value> = spec
        .hostdevs
        .iter()
        .map(|dev| {
            let (domain, bus, slot, function) = dev.components();
            json!({
                "domain": domain,
                "bus": bus,
                "slot": slot,
                "function": function,
            })
        })
        .collect();

    let context = json!({
        "name": spec.name,
        "uuid": spec.uuid.to_string(),
        "memory_mib": u64::from(spec.memory_gb) * 1024,
        "vcpus": spec.vcpus,
        "disk_path": spec.disk_path.to_string_lossy().into_owned(),
        "network": spec.network,
        "mac_address": spec.mac_address,
        "hostdevs": hostdevs,
    });
    render(domain_template_name(spec.template), &context)
}

pub(crate) fn network(spec: &NetworkSpec) -> Result<String, HypervisorError> {
    let hosts: Vec<Value> = spec
        .hosts
        .iter()
        .map(|host| {
            json!({
                "name": host.name,
                "mac": host.mac,
                "ip": host.ip.to_string(),
            })
        })
        .collect();

    let forward_mode = match spec.forward {
        ForwardMode::Nat => "nat",
        ForwardMode::Route => "route",
    };

    let context = json!({
        "name": spec.name,
        "forward_mode": forward_mode,
        "bridge": spec.bridge,
        "domain": spec.domain,
        "dns_forwarders": spec.dns_forwarders,
        "gateway": spec.gateway.to_string(),
        "prefix_len": spec.prefix_len,
        "dhcp_start": spec.dhcp_start.to_string(),
        "dhcp_end": spec.dhcp_end.to_string(),
        "hosts": hosts,
    });
    render("network", &context)
}

pub(crate) fn pool(spec: &PoolSpec) -> Result<String, HypervisorError> {
    render(
        "pool",
        &json!({
            "name": spec.name,
            "path": spec.path.to_string_lossy().into_owned(),
        }),
    )
}

/// Volume XML for copy-on-write overlays. Imports use `vol-create-as` instead.
pub(crate) fn volume(spec: &VolumeSpec) -> Result<String, HypervisorError> {
    let backing_path = match &spec.source {
        VolumeSource::BackedBy(base) => Value::from(base.to_string_lossy().into_owned()),
        VolumeSource::CopyOf(_) => Value::Null,
    };
    render(
        "volume",
        &json!({
            "name": spec.name,
            "capacity_bytes": spec.capacity_bytes,
            "format": spec.format,
            "backing_path": backing_path,
        }),
    )
}
