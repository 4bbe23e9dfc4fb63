//! Raw RPC transaction payloads → canonical [`ParsedTransaction`].
//!
//! Two strategies, in order: decode a native System Program transfer
//! instruction (including inner instructions), then fall back to inferring
//! sender/receiver/amount from balance deltas. Unparseable payloads yield
//! None — a parse miss, not an error.

use base64::Engine as _;
use common::types::{ParsedTransaction, RawInstruction, RawMessage, RawTransaction, RawTransactionMeta};

/// System Program (native SOL transfers).
const SYSTEM_PROGRAM_ID: &str = "11111111111111111111111111111111";
/// Transfer instruction discriminator within the System Program.
const SYSTEM_TRANSFER_DISCRIMINATOR: u8 = 2;

/// Full account key list: message keys plus any loaded addresses
/// (writable then readonly) appended for versioned transactions.
fn account_keys(message: &RawMessage, meta: Option<&RawTransactionMeta>) -> Vec<String> {
    let mut keys: Vec<String> = message
        .account_keys
        .iter()
        .map(|k| k.pubkey().to_string())
        .collect();
    if let Some(loaded) = meta.and_then(|m| m.loaded_addresses.as_ref()) {
        keys.extend(loaded.writable.iter().cloned());
        keys.extend(loaded.readonly.iter().cloned());
    }
    keys
}

/// Instruction data arrives base58-encoded; some RPC providers hand back
/// base64, so try both.
fn decode_instruction_data(data: &str) -> Option<Vec<u8>> {
    if data.is_empty() {
        return None;
    }
    if let Ok(raw) = bs58::decode(data).into_vec() {
        return Some(raw);
    }
    base64::engine::general_purpose::STANDARD.decode(data).ok()
}

/// Decode System Program transfer data; returns lamports or None.
fn decode_transfer_lamports(data: &str) -> Option<u64> {
    let raw = decode_instruction_data(data)?;
    if raw.len() < 9 || raw[0] != SYSTEM_TRANSFER_DISCRIMINATOR {
        return None;
    }
    let bytes: [u8; 8] = raw[1..9].try_into().ok()?;
    Some(u64::from_le_bytes(bytes))
}

/// First System Program transfer across the given instructions:
/// accounts[0] = sender, accounts[1] = receiver.
fn extract_native_transfer(
    keys: &[String],
    instructions: &[RawInstruction],
) -> Option<(String, String, u64)> {
    for ix in instructions {
        let program_id = ix.program_id_index.and_then(|idx| keys.get(idx));
        if program_id.map(String::as_str) != Some(SYSTEM_PROGRAM_ID) {
            continue;
        }
        if ix.accounts.len() < 2 {
            continue;
        }
        let (from_idx, to_idx) = (ix.accounts[0], ix.accounts[1]);
        if from_idx >= keys.len() || to_idx >= keys.len() {
            continue;
        }
        let Some(data) = ix.data.as_deref() else {
            continue;
        };
        let Some(lamports) = decode_transfer_lamports(data) else {
            continue;
        };
        return Some((keys[from_idx].clone(), keys[to_idx].clone(), lamports));
    }
    None
}

/// Infer sender/receiver/amount from balance deltas. Sender = first signer;
/// receiver = account with the largest positive delta, excluding the sender
/// (whose delta already absorbs the fee).
fn extract_from_balance_delta(
    keys: &[String],
    pre: &[u64],
    post: &[u64],
    num_required_signatures: u32,
) -> (Option<String>, Option<String>, Option<u64>) {
    if keys.is_empty() || pre.len() != keys.len() || post.len() != keys.len() {
        return (None, None, None);
    }
    let sender_idx = if num_required_signatures > 0 { Some(0) } else { None };
    let sender = sender_idx.map(|i: usize| keys[i].clone());

    let mut best: Option<(usize, u64)> = None;
    for i in 0..keys.len() {
        if Some(i) == sender_idx {
            continue;
        }
        let delta = post[i].saturating_sub(pre[i]);
        if delta == 0 {
            continue;
        }
        if best.map_or(true, |(_, b)| delta > b) {
            best = Some((i, delta));
        }
    }
    match best {
        Some((idx, delta)) => (sender, Some(keys[idx].clone()), Some(delta)),
        None => (sender, None, None),
    }
}

/// Parse a single `getTransaction` result. Handles legacy and versioned
/// transactions; returns None when the message or account keys are missing.
pub fn parse(raw: &RawTransaction) -> Option<ParsedTransaction> {
    let envelope = raw.transaction.as_ref()?;
    let message = envelope.message.as_ref()?;
    let meta = raw.meta.as_ref();

    let keys = account_keys(message, meta);
    if keys.is_empty() {
        return None;
    }

    let mut instructions: Vec<RawInstruction> = message.instructions.clone();
    if let Some(meta) = meta {
        for inner in &meta.inner_instructions {
            instructions.extend(inner.instructions.iter().cloned());
        }
    }

    let (mut sender, mut receiver, mut amount) =
        match extract_native_transfer(&keys, &instructions) {
            Some((s, r, a)) => (Some(s), Some(r), Some(a)),
            None => (None, None, None),
        };

    if sender.is_none() || receiver.is_none() || amount.is_none() {
        let num_sigs = message
            .header
            .as_ref()
            .map_or(1, |h| h.num_required_signatures);
        let empty: Vec<u64> = Vec::new();
        let (pre, post) = meta.map_or((&empty, &empty), |m| (&m.pre_balances, &m.post_balances));
        let (delta_sender, delta_receiver, delta_amount) =
            extract_from_balance_delta(&keys, pre, post, num_sigs);
        sender = sender.or(delta_sender).or_else(|| Some(keys[0].clone()));
        receiver = receiver.or(delta_receiver).or_else(|| {
            // Nothing moved that we can attribute: fall back to the second
            // account so the item still records the relationship.
            keys.get(1).cloned().or_else(|| sender.clone())
        });
        amount = amount.or(delta_amount).or(Some(0));
    }

    let signature = envelope.signatures.first().cloned();

    Some(ParsedTransaction {
        sender: sender?,
        receiver: receiver?,
        amount_lamports: amount?,
        timestamp: raw.block_time,
        signature,
        slot: raw.slot,
    })
}

/// Parse a batch, skipping unparseable items. The returned list may be
/// shorter than the input.
pub fn parse_batch(raws: &[RawTransaction]) -> Vec<ParsedTransaction> {
    raws.iter().filter_map(parse).collect()
}
