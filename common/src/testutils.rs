//! Helpers shared by tests across the workspace.

use anyhow::Result;

/// Create a small source tree:
///
/// ```text
/// tree
/// |- a.bin        (1 KiB)
/// |- b.txt
/// |- sub
///    |- c.bin     (4 KiB)
///    |- deeper
///       |- d.txt
/// ```
pub async fn setup_source_tree(base: &std::path::Path) -> Result<std::path::PathBuf> {
    let root = base.join("tree");
    tokio::fs::create_dir_all(root.join("sub").join("deeper")).await?;
    tokio::fs::write(root.join("a.bin"), deterministic_payload(1024)).await?;
    tokio::fs::write(root.join("b.txt"), b"hello fastcopy\n").await?;
    tokio::fs::write(root.join("sub").join("c.bin"), deterministic_payload(4096)).await?;
    tokio::fs::write(root.join("sub").join("deeper").join("d.txt"), b"leaf\n").await?;
    Ok(root)
}

/// Deterministic pseudo-random payload so byte-identity checks are stable.
pub fn deterministic_payload(len: usize) -> Vec<u8> {
    let mut state: u32 = 0x2545_f491;
    (0..len)
        .map(|_| {
            state = state.wrapping_mul(1_664_525).wrapping_add(1_013_904_223);
            (state >> 24) as u8
        })
        .collect()
}
