use serde::Serialize;
use sha2::{Sha256, Digest};
use shared::types::{Metadata, ServerStatus, ServerView};

/// Fields that make a view entry different to a consumer. Timestamps move
/// on every announce and are left out.
#[derive(Serialize)]
struct HashView<'a> {
    id: &'a str,
    name: &'a str,
    ip: &'a str,
    port: u16,
    version: Option<&'a str>,
    location: Option<&'a str>,
    server_type: Option<&'a str>,
    is_favorite: bool,
    notes: Option<&'a str>,
    status: ServerStatus,
    metadata: &'a Metadata,
}

/// SHA-256 over the view, independent of input order.
pub fn fingerprint(view: &[ServerView]) -> String {
    let mut indices: Vec<usize> = (0..view.len()).collect();
    indices.sort_by(|&a, &b| view[a].record.id.cmp(&view[b].record.id));

    let mut hasher = Sha256::new();
    for &i in &indices {
        let v = &view[i];
        let entry = HashView {
            id: &v.record.id,
            name: &v.record.name,
            ip: &v.record.ip,
            port: v.record.port,
            version: v.record.version.as_deref(),
            location: v.record.location.as_deref(),
            server_type: v.record.server_type.as_deref(),
            is_favorite: v.record.is_favorite,
            notes: v.record.notes.as_deref(),
            status: v.status,
            metadata: &v.metadata,
        };
        // Serializing borrowed strings and a JSON map cannot fail
        if let Ok(bytes) = serde_json::to_vec(&entry) {
            hasher.update(&bytes);
        }
        hasher.update(b"\n");
    }

    hex::encode(hasher.finalize())
}
