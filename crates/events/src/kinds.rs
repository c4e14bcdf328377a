//! Event kind names and the kind grammar.

pub const NOTE_CREATED: &str = "note.created";
pub const NOTE_UPDATED: &str = "note.updated";
pub const TAG_ADDED: &str = "tag.added";
pub const TAG_REMOVED: &str = "tag.removed";
pub const LINK_ADDED: &str = "link.added";
pub const LINK_REMOVED: &str = "link.removed";

pub const EMO_CREATED: &str = "emo.created";
pub const EMO_UPDATED: &str = "emo.updated";
pub const EMO_DELETED: &str = "emo.deleted";
pub const EMO_LINKED: &str = "emo.linked";

pub const MEMORY_ITEM_UPSERTED: &str = "memory.item.upserted";
pub const MEMORY_ITEM_DELETED: &str = "memory.item.deleted";

/// Check a kind against the grammar `segment(.segment)+` where a segment is
/// `[a-z][a-z0-9_]*`.
pub fn valid_kind(kind: &str) -> bool {
    let segments: Vec<&str> = kind.split('.').collect();
    if segments.len() < 2 {
        return false;
    }
    segments.iter().all(|seg| valid_segment(seg))
}

fn valid_segment(seg: &str) -> bool {
    let mut chars = seg.chars();
    match chars.next() {
        Some(c) if c.is_ascii_lowercase() => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_dotted_lowercase_kinds() {
        for kind in [
            NOTE_CREATED,
            EMO_UPDATED,
            MEMORY_ITEM_UPSERTED,
            "a.b",
            "ns1.sub_kind.v2",
        ] {
            assert!(valid_kind(kind), "{kind:?} should be valid");
        }
    }

    #[test]
    fn rejects_out_of_grammar_kinds() {
        for kind in [
            "",
            "note",
            "Note.created",
            "note.Created",
            "note..created",
            ".note.created",
            "note.created.",
            "1note.created",
            "note.cre ated",
            "note.cré",
        ] {
            assert!(!valid_kind(kind), "{kind:?} should be invalid");
        }
    }
}
