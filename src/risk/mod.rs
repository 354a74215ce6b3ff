//! Risk governance for the trading core.
//!
//! - [`CapitalManager`]: capital pools with atomic lock/release
//! - [`PolicyLayer`]: approval gate for every state-changing action
//! - [`KillSwitch`]: sticky emergency stop that freezes capital

mod capital;
mod kill_switch;
mod policy;

pub use capital::{CapitalManager, CapitalPool, CapitalSnapshot};
pub use kill_switch::{KillCallback, KillSwitch, KillSwitchStatus, KillTrigger};
pub use policy::{BotState, PolicyAction, PolicyDecision, PolicyLayer};
