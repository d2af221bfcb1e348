//! The slice of a user profile the delivery path needs.

use serde::{Deserialize, Serialize};

use super::ids::UserId;

/// A user's name and encrypted contact number.
///
/// `phone_cipher` is produced by [`crate::contacts::PhoneCipher::encrypt`];
/// the plaintext number only exists in memory for the duration of a send.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserContact {
    pub user_id: UserId,
    pub nickname: String,
    pub phone_cipher: String,
}
