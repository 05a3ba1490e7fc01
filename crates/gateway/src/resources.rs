//! Periodic resource reporting.
//!
//! Summarises the registry (user count, live trees, envelope-log sizes)
//! to the log and to `<data_dir>/resources.txt`.

use std::fmt::Write as _;

use crate::state::AppState;

/// Gather the current usage summary.
pub async fn usage_summary(state: &AppState) -> (usize, usize, usize) {
    let user_ids = state.users.user_ids();
    let mut tree_count = 0usize;
    let mut envelope_count = 0usize;

    for user_id in &user_ids {
        let Ok(user) = state.users.get_user(user_id) else {
            continue;
        };
        for conversation_id in user.trees.conversation_ids() {
            let Ok(handle) = user.trees.get_tree(&conversation_id) else {
                continue;
            };
            tree_count += 1;
            // A busy tree is skipped rather than waited on; the next report
            // picks it up.
            let lock_result = handle.tree.try_lock();
            if let Ok(tree) = lock_result {
                envelope_count += tree.envelope_log.len();
            }
        }
    }

    (user_ids.len(), tree_count, envelope_count)
}

/// Write the report to the log and to `resources.txt` in the data dir.
pub async fn report(state: &AppState) -> std::io::Result<()> {
    let (users, trees, envelopes) = usage_summary(state).await;

    tracing::info!(users, trees, envelopes, "resource report");

    let mut out = String::new();
    let _ = writeln!(out, "arbor resources");
    let _ = writeln!(out, "---------------");
    let _ = writeln!(out, "local users:    {users}");
    let _ = writeln!(out, "live trees:     {trees}");
    let _ = writeln!(out, "logged frames:  {envelopes}");

    std::fs::create_dir_all(&state.config.data_dir)?;
    std::fs::write(state.config.data_dir.join("resources.txt"), out)?;
    Ok(())
}
