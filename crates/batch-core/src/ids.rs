//! OpenAI-shaped opaque identifier generation.

use uuid::Uuid;

fn short_uuid() -> String {
    Uuid::new_v4().simple().to_string()
}

pub fn new_input_file_id() -> String {
    format!("file-{}", short_uuid())
}

pub fn new_output_file_id() -> String {
    format!("file-out-{}", short_uuid())
}

pub fn new_error_file_id() -> String {
    format!("file-err-{}", short_uuid())
}

pub fn new_batch_id() -> String {
    format!("batch_{}", short_uuid())
}

pub fn new_result_id() -> String {
    format!("batch_req_{}", short_uuid())
}

/// Output/error blob ids are derived from the batch id rather than
/// randomly generated, so a worker resuming after a crash can find its
/// own partially written file without first consulting the database.
pub fn output_file_id_for_batch(batch_id: &str) -> String {
    format!("file-out-{batch_id}")
}

pub fn error_file_id_for_batch(batch_id: &str) -> String {
    format!("file-err-{batch_id}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prefixes() {
        assert!(new_input_file_id().starts_with("file-"));
        assert!(new_output_file_id().starts_with("file-out-"));
        assert!(new_error_file_id().starts_with("file-err-"));
        assert!(new_batch_id().starts_with("batch_"));
    }

    #[test]
    fn test_ids_unique() {
        assert_ne!(new_batch_id(), new_batch_id());
    }
}
