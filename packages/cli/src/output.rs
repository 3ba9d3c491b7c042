// ABOUTME: Terminal rendering of sandbox listings and reports
// ABOUTME: Tables via comfy-table; credentials block printed once after create

use chunkhost_sandbox::{AbuseFlag, SandboxListing, SandboxSummary};
use comfy_table::{modifiers::UTF8_ROUND_CORNERS, presets::UTF8_FULL, ContentArrangement, Table};

fn new_table(header: Vec<&str>) -> Table {
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .apply_modifier(UTF8_ROUND_CORNERS)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(header);
    table
}

pub fn sandbox_table(sandboxes: &[SandboxListing]) -> Table {
    let mut table = new_table(vec!["ID", "Login", "Created"]);
    for sandbox in sandboxes {
        table.add_row(vec![
            sandbox.sandbox_id.clone(),
            sandbox.login_user.clone(),
            sandbox.created_at.format("%Y-%m-%d %H:%M UTC").to_string(),
        ]);
    }
    table
}

pub fn abuse_table(flags: &[AbuseFlag]) -> Table {
    let mut table = new_table(vec!["Sandbox", "Owner", "Pattern", "Process"]);
    for flag in flags {
        table.add_row(vec![
            flag.sandbox_id.clone(),
            flag.owner_id.clone(),
            flag.pattern.to_string(),
            flag.process.clone(),
        ]);
    }
    table
}

/// Lines shown once to the requester; the secrets cannot be retrieved later
pub fn credentials_block(summary: &SandboxSummary) -> Vec<String> {
    vec![
        format!("Sandbox ID:     {}", summary.sandbox_id),
        format!("Login user:     {}", summary.login_user),
        format!("Login password: {}", summary.login_secret),
        format!("Root password:  {}", summary.root_secret),
    ]
}
