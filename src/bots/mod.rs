pub mod manager;
pub mod momentum;
pub mod spread;

pub use manager::{BotManager, CreateBot};
pub use momentum::MomentumHunterBot;
pub use spread::SpreadMakerBot;
