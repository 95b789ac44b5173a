//! Channel accounts: leasing and provisioning

mod manager;
mod pool;

pub use manager::{
    ChannelAccountManager, ChannelAccountsReport, MAX_CHANNEL_ACCOUNTS,
    MAX_CHANNEL_ACCOUNTS_PER_TX, REVOKE_SPONSORSHIP_RESERVE_AMOUNT,
};
pub use pool::{ChannelAccountLease, ChannelAccountPool};
