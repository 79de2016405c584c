pub mod helpers;
pub mod mock_api;
pub mod mock_dispatch;
