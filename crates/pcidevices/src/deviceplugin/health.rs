//! Maps filesystem events to unit health transitions.

use std::collections::BTreeSet;
use std::path::Path;
use std::path::PathBuf;

use notify::event::ModifyKind;
use notify::event::RenameMode;
use notify::Event;
use notify::EventKind;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HealthSignal {
    Unit { id: String, healthy: bool },
    /// The kubelet removed our socket, usually because it restarted.
    SocketRemoved,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Change {
    Appeared,
    Vanished,
}

fn changes(event: &Event) -> Vec<(&Path, Change)> {
    let paths = event.paths.iter().map(PathBuf::as_path);
    match event.kind {
        EventKind::Create(_) => paths.map(|p| (p, Change::Appeared)).collect(),
        EventKind::Remove(_) => paths.map(|p| (p, Change::Vanished)).collect(),
        EventKind::Modify(ModifyKind::Name(RenameMode::From)) => {
            paths.map(|p| (p, Change::Vanished)).collect()
        }
        EventKind::Modify(ModifyKind::Name(RenameMode::To)) => {
            paths.map(|p| (p, Change::Appeared)).collect()
        }
        EventKind::Modify(ModifyKind::Name(RenameMode::Both)) => event
            .paths
            .iter()
            .enumerate()
            .map(|(i, p)| {
                let change = if i == 0 {
                    Change::Vanished
                } else {
                    Change::Appeared
                };
                (p.as_path(), change)
            })
            .collect(),
        EventKind::Modify(ModifyKind::Name(_)) => paths
            .map(|p| {
                let change = if p.exists() {
                    Change::Appeared
                } else {
                    Change::Vanished
                };
                (p, change)
            })
            .collect(),
        _ => Vec::new(),
    }
}

/// Classifies one event against the plugin socket and the backing path of
/// every unit. A vanished directory takes every unit below it with it; an
/// appeared directory revives only the units whose path now exists.
pub fn classify(event: &Event, socket: &Path, units: &[(String, PathBuf)]) -> Vec<HealthSignal> {
    let mut signals = Vec::new();
    for (path, change) in changes(event) {
        if path == socket {
            if change == Change::Vanished {
                signals.push(HealthSignal::SocketRemoved);
            }
            continue;
        }
        for (id, unit_path) in units {
            if !unit_path.starts_with(path) {
                continue;
            }
            let healthy = match change {
                Change::Vanished => false,
                Change::Appeared => unit_path.exists(),
            };
            signals.push(HealthSignal::Unit {
                id: id.clone(),
                healthy,
            });
        }
    }
    signals
}

/// Directories to watch for the given paths: the closest existing ancestor
/// of each, since sysfs and devtmpfs report changes on the parent.
pub fn watch_targets<'a>(paths: impl IntoIterator<Item = &'a Path>) -> BTreeSet<PathBuf> {
    paths
        .into_iter()
        .filter_map(|p| p.ancestors().skip(1).find(|a| a.is_dir()))
        .map(Path::to_path_buf)
        .collect()
}

#[cfg(test)]
mod tests {
    use notify::event::CreateKind;
    use notify::event::RemoveKind;
    use similar_asserts::assert_eq;

    use super::*;

    fn event(kind: EventKind, paths: &[&Path]) -> Event {
        let mut event = Event::new(kind);
        for p in paths {
            event = event.add_path(p.to_path_buf());
        }
        event
    }

    #[test]
    fn removal_marks_unit_unhealthy() {
        let units = vec![
            ("a".to_string(), PathBuf::from("/dev/vfio/14")),
            ("b".to_string(), PathBuf::from("/dev/vfio/15")),
        ];
        let signals = classify(
            &event(EventKind::Remove(RemoveKind::File), &[Path::new("/dev/vfio/14")]),
            Path::new("/plugins/x.sock"),
            &units,
        );
        assert_eq!(
            signals,
            vec![HealthSignal::Unit {
                id: "a".to_string(),
                healthy: false
            }]
        );
    }

    #[test]
    fn directory_removal_covers_children() {
        let units = vec![
            ("1:2".to_string(), PathBuf::from("/dev/bus/usb/001/002")),
            ("2:2".to_string(), PathBuf::from("/dev/bus/usb/002/002")),
        ];
        let signals = classify(
            &event(EventKind::Remove(RemoveKind::Folder), &[Path::new("/dev/bus/usb/001")]),
            Path::new("/plugins/x.sock"),
            &units,
        );
        assert_eq!(
            signals,
            vec![HealthSignal::Unit {
                id: "1:2".to_string(),
                healthy: false
            }]
        );
    }

    #[test]
    fn creation_checks_existence() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let node = tmp.path().join("14");
        std::fs::write(&node, "").expect("node");
        let units = vec![("a".to_string(), node.clone())];

        let signals = classify(
            &event(EventKind::Create(CreateKind::File), &[node.as_path()]),
            &tmp.path().join("x.sock"),
            &units,
        );
        assert_eq!(
            signals,
            vec![HealthSignal::Unit {
                id: "a".to_string(),
                healthy: true
            }]
        );
    }

    #[test]
    fn socket_removal_is_reported() {
        let socket = Path::new("/plugins/nvidia.com_A2.sock");
        let signals = classify(
            &event(EventKind::Remove(RemoveKind::File), &[socket]),
            socket,
            &[],
        );
        assert_eq!(signals, vec![HealthSignal::SocketRemoved]);

        let created = classify(
            &event(EventKind::Create(CreateKind::File), &[socket]),
            socket,
            &[],
        );
        assert_eq!(created, Vec::new());
    }

    #[test]
    fn rename_both_splits_paths() {
        let units = vec![("a".to_string(), PathBuf::from("/dev/vfio/14"))];
        let signals = classify(
            &event(
                EventKind::Modify(ModifyKind::Name(RenameMode::Both)),
                &[Path::new("/dev/vfio/14"), Path::new("/dev/vfio/14.old")],
            ),
            Path::new("/plugins/x.sock"),
            &units,
        );
        assert_eq!(
            signals,
            vec![HealthSignal::Unit {
                id: "a".to_string(),
                healthy: false
            }]
        );
    }

    #[test]
    fn watch_targets_use_existing_ancestors() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let missing = tmp.path().join("vfio/14");
        let targets = watch_targets([missing.as_path()]);
        assert_eq!(targets, BTreeSet::from([tmp.path().to_path_buf()]));
    }
}
