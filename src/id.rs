use uuid::Uuid;

/// Generates a collision-resistant id for `message_id` and `transaction_id`.
///
/// UUID v7 keeps ids roughly time-ordered without any coordination between processes.
pub fn new_id() -> String {
    Uuid::now_v7().to_string()
}
