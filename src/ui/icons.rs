//! Shared UI icons.

use console::Emoji;

// Status indicators
pub static CHECK: Emoji<'_, '_> = Emoji("✅ ", "[OK]");
pub static CROSS: Emoji<'_, '_> = Emoji("❌ ", "[ERR]");
pub static WARN: Emoji<'_, '_> = Emoji("⚠️  ", "[WARN]");
pub static SPARKLE: Emoji<'_, '_> = Emoji("✨ ", "*");
pub static SKIP: Emoji<'_, '_> = Emoji("⏭️  ", "[SKIP]");

// Progress indicators
pub static RUNNING: Emoji<'_, '_> = Emoji("▶️  ", "[>]");
pub static RETRY: Emoji<'_, '_> = Emoji("🔁 ", "[RETRY]");
pub static PAUSE: Emoji<'_, '_> = Emoji("⏸️  ", "[PAUSE]");
pub static ROLLBACK: Emoji<'_, '_> = Emoji("⏪ ", "[RB]");
pub static HEALTH: Emoji<'_, '_> = Emoji("🩺 ", "[HEALTH]");
pub static ISSUE: Emoji<'_, '_> = Emoji("🚧 ", "[ISSUE]");
