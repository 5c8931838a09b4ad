use std::path::PathBuf;
use std::sync::Arc;

use securechat_crypto::MessageCipher;
use securechat_db::Database;
use securechat_gateway::Dispatcher;
use securechat_moderation::RiskClassifier;

pub type AppState = Arc<AppStateInner>;

pub struct AppStateInner {
    pub db: Arc<Database>,
    pub cipher: MessageCipher,
    pub classifier: RiskClassifier,
    pub dispatcher: Dispatcher,
    pub jwt_secret: String,
    pub uploads_dir: PathBuf,
}
