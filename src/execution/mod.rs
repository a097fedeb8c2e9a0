pub mod bankroll;
pub mod copy_engine;
pub mod executor;
pub mod position_sizer;
pub mod risk_manager;

pub use bankroll::{BankrollError, Ledger, VirtualBankroll};
pub use executor::{Executor, ExecutorError, Fill, LiveExecutor, PaperExecutor};
pub use risk_manager::{RiskManager, RiskViolation};
