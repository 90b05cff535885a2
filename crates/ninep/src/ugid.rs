//! Process-wide user/group name↔id maps, used to fill in the `.u`
//! `n_uid`/`n_gid`/`n_muid` stat fields and to resolve the `uid`/`gid`
//! name strings written alongside them.

use std::collections::HashMap;
use std::sync::OnceLock;
use tokio::io::{AsyncBufReadExt, BufReader};

#[derive(Default)]
struct IdMap {
    name_to_id: HashMap<String, u32>,
    id_to_name: HashMap<u32, String>,
}

impl IdMap {
    fn register(&mut self, name: &str, id: u32) {
        self.name_to_id.insert(name.to_owned(), id);
        self.id_to_name.insert(id, name.to_owned());
    }
}

#[derive(Default)]
struct UserGroupMaps {
    users: IdMap,
    groups: IdMap,
}

static MAPS: OnceLock<std::sync::RwLock<UserGroupMaps>> = OnceLock::new();

fn maps() -> &'static std::sync::RwLock<UserGroupMaps> {
    MAPS.get_or_init(|| std::sync::RwLock::new(UserGroupMaps::default()))
}

/// Parse one `name:...:id:...` record, `/etc/passwd` or `/etc/group`
/// style: first field is the name, third is the decimal id.
fn parse_record(line: &str) -> Option<(&str, u32)> {
    let mut fields = line.split(':');
    let name = fields.next()?;
    let _second = fields.next()?;
    let id: u32 = fields.next()?.parse().ok()?;
    if name.is_empty() {
        return None;
    }
    Some((name, id))
}

async fn load_into<R: tokio::io::AsyncRead + Unpin>(reader: R, map: &mut IdMap) {
    let mut lines = BufReader::new(reader).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        if let Some((name, id)) = parse_record(&line) {
            map.register(name, id);
        }
    }
}

/// Refresh the process-wide user/group maps from `/etc/passwd` and
/// `/etc/group`. Safe to call repeatedly; later entries for a name
/// overwrite earlier ones, matching the source record order.
pub async fn update_ids() -> std::io::Result<()> {
    let passwd = tokio::fs::File::open("/etc/passwd").await?;
    let group = tokio::fs::File::open("/etc/group").await?;

    let mut guard = maps().write().unwrap_or_else(|e| e.into_inner());
    load_into(passwd, &mut guard.users).await;
    load_into(group, &mut guard.groups).await;
    Ok(())
}

pub fn uid_for_name(name: &str) -> Option<u32> {
    maps()
        .read()
        .unwrap_or_else(|e| e.into_inner())
        .users
        .name_to_id
        .get(name)
        .copied()
}

pub fn gid_for_name(name: &str) -> Option<u32> {
    maps()
        .read()
        .unwrap_or_else(|e| e.into_inner())
        .groups
        .name_to_id
        .get(name)
        .copied()
}

pub fn name_for_uid(id: u32) -> Option<String> {
    maps()
        .read()
        .unwrap_or_else(|e| e.into_inner())
        .users
        .id_to_name
        .get(&id)
        .cloned()
}

pub fn name_for_gid(id: u32) -> Option<String> {
    maps()
        .read()
        .unwrap_or_else(|e| e.into_inner())
        .groups
        .id_to_name
        .get(&id)
        .cloned()
}

/// Opportunistically register a decoded `(name, id)` pair so future
/// encodes can round-trip it, per the `.u` stat decode tolerance rule.
pub fn register_user(name: &str, id: u32) {
    if name.is_empty() {
        return;
    }
    maps()
        .write()
        .unwrap_or_else(|e| e.into_inner())
        .users
        .register(name, id);
}

pub fn register_group(name: &str, id: u32) {
    if name.is_empty() {
        return;
    }
    maps()
        .write()
        .unwrap_or_else(|e| e.into_inner())
        .groups
        .register(name, id);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_passwd_style_record() {
        assert_eq!(
            parse_record("glenda:x:1000:1000:Glenda:/usr/glenda:/bin/rc"),
            Some(("glenda", 1000))
        );
        assert_eq!(parse_record(""), None);
        assert_eq!(parse_record("noid"), None);
    }

    #[test]
    fn registers_and_resolves_round_trip() {
        register_user("ken", 2);
        assert_eq!(uid_for_name("ken"), Some(2));
        assert_eq!(name_for_uid(2), Some("ken".to_owned()));
    }
}
