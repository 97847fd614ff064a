//! Page-file validation and repair ahead of the external converter.
//!
//! Old batch archives occasionally hold records whose `type` tag was lost.
//! The converter refuses untagged records, so tags are re-inferred from the
//! fields that are unique to each transaction kind and the file rewritten
//! in place. Files that cannot be made whole are dropped from the batch.

use std::path::Path;

use serde_json::Value;

const KNOWN_TYPES: [&str; 5] = [
    "pending_transaction",
    "user_transaction",
    "genesis_transaction",
    "block_metadata_transaction",
    "state_checkpoint_transaction",
];

#[derive(Debug, PartialEq, Eq)]
pub enum PageOutcome {
    /// Every record carried a known tag already.
    Valid,
    /// Tags were inferred and the file rewritten.
    Repaired,
    Dropped(DropReason),
}

#[derive(Debug, PartialEq, Eq)]
pub enum DropReason {
    Empty,
    Unparseable,
}

pub async fn validate_page_file(path: &Path) -> std::io::Result<PageOutcome> {
    let raw = tokio::fs::read(path).await?;
    if raw.iter().all(u8::is_ascii_whitespace) {
        return Ok(PageOutcome::Dropped(DropReason::Empty));
    }
    let Ok(mut parsed) = serde_json::from_slice::<Value>(&raw) else {
        return Ok(PageOutcome::Dropped(DropReason::Unparseable));
    };

    let records: Vec<&mut Value> = match &mut parsed {
        Value::Array(items) => items.iter_mut().collect(),
        single @ Value::Object(_) => vec![single],
        _ => return Ok(PageOutcome::Dropped(DropReason::Unparseable)),
    };

    let mut repaired = false;
    for record in records {
        let Value::Object(fields) = record else {
            return Ok(PageOutcome::Dropped(DropReason::Unparseable));
        };
        let tagged = fields
            .get("type")
            .and_then(Value::as_str)
            .is_some_and(|tag| KNOWN_TYPES.contains(&tag));
        if tagged {
            continue;
        }
        let inferred = infer_type(fields);
        fields.insert("type".to_string(), Value::String(inferred.to_string()));
        repaired = true;
    }

    if repaired {
        let bytes = serde_json::to_vec(&parsed).map_err(std::io::Error::other)?;
        tokio::fs::write(path, bytes).await?;
        return Ok(PageOutcome::Repaired);
    }
    Ok(PageOutcome::Valid)
}

fn infer_type(fields: &serde_json::Map<String, Value>) -> &'static str {
    if fields.contains_key("proposer") && fields.contains_key("previous_block_votes_bitvec") {
        return "block_metadata_transaction";
    }
    if fields.contains_key("state_checkpoint_hash") {
        return "state_checkpoint_transaction";
    }
    let is_genesis = match fields.get("version") {
        Some(Value::String(version)) => version == "0",
        Some(Value::Number(version)) => version.as_u64() == Some(0),
        _ => false,
    };
    if is_genesis {
        return "genesis_transaction";
    }
    "user_transaction"
}
