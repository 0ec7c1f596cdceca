//! Human and `--quiet` renderings of engine reports.

use anyhow::Result;
use serde::Serialize;
use vhdm_core::{DetachHistoryEntry, DetachOutcome};
use vhdm_engine::{
    AttachAction, AttachReport, ForgetReport, FormatReport, MountReport, StatusEntry,
    UnmountReport,
};

fn or_dash(value: Option<&str>) -> &str {
    value.filter(|value| !value.is_empty()).unwrap_or("-")
}

fn print_warnings(warnings: &[String]) {
    for warning in warnings {
        eprintln!("warning: {warning}");
    }
}

pub fn json<T: Serialize + ?Sized>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

pub fn mount_line(report: &MountReport) -> String {
    format!(
        "mounted uuid={} dev={} at={} action={}",
        report.uuid,
        report.device_name,
        report.mount_point,
        report.action.as_str()
    )
}

pub fn mount(report: &MountReport, quiet: bool) {
    print_warnings(&report.warnings);
    if quiet {
        println!("{}", mount_line(report));
        return;
    }
    println!("path: {}", or_dash(report.path.as_deref()));
    println!("uuid: {}", report.uuid);
    println!("device: /dev/{}", report.device_name);
    println!("mount_point: {}", report.mount_point);
    println!("action: {}", report.action.as_str());
}

fn attach_action(action: AttachAction) -> &'static str {
    match action {
        AttachAction::Attached => "attach",
        AttachAction::AlreadyAttached => "none",
    }
}

pub fn attach(report: &AttachReport, quiet: bool) {
    print_warnings(&report.warnings);
    if quiet {
        println!(
            "attached uuid={} dev={} action={}",
            or_dash(report.uuid.as_deref()),
            report.device_name,
            attach_action(report.action)
        );
        return;
    }
    println!("path: {}", or_dash(report.path.as_deref()));
    println!("uuid: {}", or_dash(report.uuid.as_deref()));
    println!("device: /dev/{}", report.device_name);
    println!("action: {}", attach_action(report.action));
}

fn detach_outcome(outcome: Option<DetachOutcome>) -> &'static str {
    match outcome {
        Some(DetachOutcome::Detached) => "detached",
        Some(DetachOutcome::NotAttached) => "not-attached",
        None => "-",
    }
}

pub fn unmount_line(report: &UnmountReport) -> String {
    format!(
        "unmounted uuid={} dev={} from={} detach={}",
        or_dash(report.uuid.as_deref()),
        or_dash(report.device_name.as_deref()),
        or_dash(report.unmounted_from.as_deref()),
        detach_outcome(report.detach)
    )
}

pub fn unmount(report: &UnmountReport, quiet: bool) {
    print_warnings(&report.warnings);
    if quiet {
        println!("{}", unmount_line(report));
        return;
    }
    println!("path: {}", or_dash(report.path.as_deref()));
    println!("uuid: {}", or_dash(report.uuid.as_deref()));
    match &report.unmounted_from {
        Some(mount_point) => println!("unmounted: {mount_point}"),
        None => println!("unmounted: nothing was mounted"),
    }
    if report.detach.is_some() {
        println!("detach: {}", detach_outcome(report.detach));
    }
}

pub fn status_line(entry: &StatusEntry) -> String {
    format!(
        "path={} uuid={} dev={} attached={} mounted={} tracked={}",
        or_dash(entry.path.as_deref()),
        or_dash(entry.uuid.as_deref()),
        or_dash(entry.device_name.as_deref()),
        entry.attached,
        or_dash(entry.mount_point.as_deref()),
        entry.tracked
    )
}

pub fn status(entries: &[StatusEntry], quiet: bool) {
    if entries.is_empty() && !quiet {
        println!("no VHDs tracked or attached");
        return;
    }
    for entry in entries {
        if quiet {
            println!("{}", status_line(entry));
            continue;
        }
        println!("{}", or_dash(entry.path.as_deref()));
        println!("  uuid: {}", or_dash(entry.uuid.as_deref()));
        let state = match (entry.attached, &entry.mount_point) {
            (true, Some(mount_point)) => format!("mounted at {mount_point}"),
            (true, None) => "attached, not mounted".to_string(),
            (false, _) if entry.tracked => "detached (tracked)".to_string(),
            (false, _) => "detached".to_string(),
        };
        println!("  state: {state}");
        if let Some(device) = &entry.device_name {
            println!("  device: /dev/{device}");
        }
        if let Some(fs_type) = &entry.fs_type {
            println!("  fs_type: {fs_type}");
        }
        if let Some(size) = entry.size_bytes {
            println!("  size_bytes: {size}");
        }
        if let (Some(used), Some(percent)) = (entry.fs_used_bytes, &entry.fs_use_percent) {
            println!("  used: {used} ({percent})");
        }
        if let Some(stamp) = &entry.last_attached {
            println!("  last_attached: {stamp}");
        }
    }
}

pub fn history(entries: &[DetachHistoryEntry]) {
    if entries.is_empty() {
        println!("no detach history");
    }
    for entry in entries {
        println!(
            "{} {} uuid={} dev={}",
            entry.timestamp,
            entry.path,
            or_dash(Some(entry.uuid.as_str())),
            or_dash(Some(entry.device_name.as_str()))
        );
    }
}

pub fn format(report: &FormatReport, quiet: bool) {
    print_warnings(&report.warnings);
    if quiet {
        println!(
            "formatted dev={} type={} uuid={}",
            report.device_name, report.fs_type, report.uuid
        );
        return;
    }
    println!("path: {}", or_dash(report.path.as_deref()));
    println!("device: /dev/{}", report.device_name);
    println!("fs_type: {}", report.fs_type);
    println!("uuid: {}", report.uuid);
    if let Some(previous) = &report.previous_uuid {
        println!("previous_uuid: {previous}");
    }
}

pub fn forget(report: &ForgetReport, quiet: bool) {
    if quiet {
        println!(
            "forgot path={} mapping={} history={}",
            report.path, report.mapping_removed, report.history_removed
        );
        return;
    }
    println!("path: {}", report.path);
    println!("mapping_removed: {}", report.mapping_removed);
    println!("history_removed: {}", report.history_removed);
}

#[cfg(test)]
mod tests {
    use super::*;
    use vhdm_engine::MountAction;

    #[test]
    fn quiet_mount_line() {
        let report = MountReport {
            path: Some("C:/VMs/data.vhdx".to_string()),
            uuid: "uuid-a".to_string(),
            device_name: "sde".to_string(),
            mount_point: "/mnt/data".to_string(),
            action: MountAction::AttachedAndMounted,
            warnings: Vec::new(),
        };
        assert_eq!(
            mount_line(&report),
            "mounted uuid=uuid-a dev=sde at=/mnt/data action=attach+mount"
        );
    }

    #[test]
    fn quiet_lines_fill_unknowns_with_dash() {
        let report = UnmountReport::default();
        assert_eq!(unmount_line(&report), "unmounted uuid=- dev=- from=- detach=-");

        let entry = StatusEntry {
            path: Some("C:/VMs/a.vhdx".to_string()),
            tracked: true,
            ..Default::default()
        };
        assert_eq!(
            status_line(&entry),
            "path=C:/VMs/a.vhdx uuid=- dev=- attached=false mounted=- tracked=true"
        );
    }
}
