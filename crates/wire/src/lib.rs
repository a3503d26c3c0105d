pub mod error;
pub mod message;
pub mod protocol;
pub mod reqrep;
pub mod traits;
pub mod transport;

pub use error::WireError;
pub use message::Message;
pub use reqrep::{ReplyToken, ZmqRequestClient, ZmqRequestServer};
pub use traits::{RequestHandler, RequestSender};
pub use transport::Transport;
