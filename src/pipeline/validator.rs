//! Exact-shape transaction validation
//!
//! The validator walks a loosely typed [`RawValue`] tree and builds the
//! canonical [`Transaction`]. The schema is closed: every expected key must
//! be present with the expected type, and any key it does not know about is
//! reported as an issue instead of being dropped. All issues are collected
//! so one failure report describes the whole shape.

use std::collections::{BTreeMap, HashMap};
use std::fmt::Write as _;

use num_bigint::BigUint;

use super::codec::RawValue;
use super::errors::{IssueKind, SchemaError, SchemaIssue};
use crate::types::{
    Account, Instruction, InstructionErrorCause, TokenBalance, Transaction, TransactionError,
    TransactionVersion,
};

const TRANSACTION_KEYS: &[&str] = &[
    "blockTime",
    "slot",
    "recentBlockhash",
    "computeUnitsConsumed",
    "err",
    "fee",
    "signatures",
    "version",
    "logMessages",
    "accounts",
    "instructions",
];

const ACCOUNT_KEYS: &[&str] = &[
    "pubkey",
    "isSigner",
    "isWriteable",
    "preBalance",
    "postBalance",
    "preTokenBalance",
    "postTokenBalance",
];

const TOKEN_BALANCE_KEYS: &[&str] = &["mint", "owner", "amount", "decimals"];

const INSTRUCTION_KEYS: &[&str] = &["stackHeight", "programIdIndex", "data", "accounts"];

const ERROR_KEYS: &[&str] = &["InstructionError", "InsufficientFundsForRent"];

type Object = BTreeMap<String, RawValue>;

/// Validate a loosely typed shape and build the canonical transaction
pub fn validate(raw: &RawValue) -> Result<Transaction, SchemaError> {
    let mut validator = Validator::default();
    match validator.transaction(raw) {
        Some(transaction) if validator.issues.is_empty() => Ok(transaction),
        _ => Err(SchemaError {
            issues: validator.issues,
        }),
    }
}

enum Segment {
    Key(String),
    Index(usize),
}

#[derive(Default)]
struct Validator {
    path: Vec<Segment>,
    issues: Vec<SchemaIssue>,
}

impl Validator {
    fn path_string(&self) -> String {
        let mut out = String::new();
        for segment in &self.path {
            match segment {
                Segment::Key(key) => {
                    if !out.is_empty() {
                        out.push('.');
                    }
                    out.push_str(key);
                }
                Segment::Index(index) => {
                    let _ = write!(out, "[{index}]");
                }
            }
        }
        out
    }

    fn issue(&mut self, kind: IssueKind) {
        let path = self.path_string();
        self.issues.push(SchemaIssue { path, kind });
    }

    fn type_issue(&mut self, expected: &'static str, value: &RawValue) {
        self.issue(IssueKind::InvalidType {
            expected,
            received: value.type_name(),
        });
    }

    fn at_key<T>(&mut self, key: &str, f: impl FnOnce(&mut Self) -> T) -> T {
        self.path.push(Segment::Key(key.to_string()));
        let out = f(self);
        self.path.pop();
        out
    }

    fn at_index<T>(&mut self, index: usize, f: impl FnOnce(&mut Self) -> T) -> T {
        self.path.push(Segment::Index(index));
        let out = f(self);
        self.path.pop();
        out
    }

    /// Check for an object and report keys outside `allowed`
    fn object<'v>(&mut self, value: &'v RawValue, allowed: &[&str]) -> Option<&'v Object> {
        let RawValue::Object(map) = value else {
            self.type_issue("object", value);
            return None;
        };
        for key in map.keys() {
            if !allowed.contains(&key.as_str()) {
                self.at_key(key, |v| v.issue(IssueKind::UnrecognizedKey));
            }
        }
        Some(map)
    }

    fn required<'v, T>(
        &mut self,
        obj: &'v Object,
        key: &str,
        read: impl FnOnce(&mut Self, &'v RawValue) -> Option<T>,
    ) -> Option<T> {
        self.at_key(key, |v| match obj.get(key) {
            Some(value) => read(v, value),
            None => {
                v.issue(IssueKind::Required);
                None
            }
        })
    }

    /// `Some(None)` when the key is absent, `None` when present but invalid
    fn optional<'v, T>(
        &mut self,
        obj: &'v Object,
        key: &str,
        read: impl FnOnce(&mut Self, &'v RawValue) -> Option<T>,
    ) -> Option<Option<T>> {
        self.at_key(key, |v| match obj.get(key) {
            Some(value) => read(v, value).map(Some),
            None => Some(None),
        })
    }

    fn array<'v, T>(
        &mut self,
        value: &'v RawValue,
        mut read: impl FnMut(&mut Self, &'v RawValue) -> Option<T>,
    ) -> Option<Vec<T>> {
        let RawValue::Array(items) = value else {
            self.type_issue("array", value);
            return None;
        };
        let mut out = Vec::with_capacity(items.len());
        let mut complete = true;
        for (index, item) in items.iter().enumerate() {
            match self.at_index(index, |v| read(v, item)) {
                Some(parsed) => out.push(parsed),
                None => complete = false,
            }
        }
        complete.then_some(out)
    }

    fn boolean(&mut self, value: &RawValue) -> Option<bool> {
        match value {
            RawValue::Bool(b) => Some(*b),
            other => {
                self.type_issue("boolean", other);
                None
            }
        }
    }

    fn string(&mut self, value: &RawValue) -> Option<String> {
        match value {
            RawValue::String(s) => Some(s.clone()),
            other => {
                self.type_issue("string", other);
                None
            }
        }
    }

    fn base58(&mut self, value: &RawValue) -> Option<String> {
        let text = self.string(value)?;
        if bs58::decode(&text).into_vec().is_err() {
            self.issue(IssueKind::InvalidBase58);
            return None;
        }
        Some(text)
    }

    /// Public keys, signatures and blockhashes: non-empty base58 text
    fn id(&mut self, value: &RawValue) -> Option<String> {
        let text = self.base58(value)?;
        if text.is_empty() {
            self.issue(IssueKind::Empty);
            return None;
        }
        Some(text)
    }

    fn big(&mut self, value: &RawValue) -> Option<BigUint> {
        match value {
            RawValue::BigInt(n) => Some(n.clone()),
            other => {
                self.type_issue("bigint", other);
                None
            }
        }
    }

    fn integer<T: TryFrom<i128>>(&mut self, value: &RawValue, expected: &'static str) -> Option<T> {
        let wide = match value {
            RawValue::Number(n) => n
                .as_u64()
                .map(i128::from)
                .or_else(|| n.as_i64().map(i128::from)),
            _ => None,
        };
        let Some(wide) = wide else {
            self.type_issue("integer", value);
            return None;
        };
        match T::try_from(wide) {
            Ok(n) => Some(n),
            Err(_) => {
                self.issue(IssueKind::OutOfRange { expected });
                None
            }
        }
    }

    fn transaction(&mut self, raw: &RawValue) -> Option<Transaction> {
        let obj = self.object(raw, TRANSACTION_KEYS)?;

        let block_time = self.required(obj, "blockTime", |v, x| v.integer::<i64>(x, "i64"));
        let slot = self.required(obj, "slot", |v, x| v.integer::<u64>(x, "u64"));
        let recent_blockhash = self.required(obj, "recentBlockhash", Self::id);
        let compute_units_consumed = self.required(obj, "computeUnitsConsumed", Self::big);
        let err = self.optional(obj, "err", Self::transaction_error);
        let fee = self.required(obj, "fee", Self::big);
        let signatures = self.required(obj, "signatures", Self::signatures);
        let version = self.required(obj, "version", Self::version);
        let log_messages = self.required(obj, "logMessages", |v, x| v.array(x, Self::string));
        let accounts = self.required(obj, "accounts", Self::accounts);
        let instructions =
            self.required(obj, "instructions", |v, x| v.array(x, Self::instruction));

        Some(Transaction {
            block_time: block_time?,
            slot: slot?,
            recent_blockhash: recent_blockhash?,
            compute_units_consumed: compute_units_consumed?,
            err: err?,
            fee: fee?,
            signatures: signatures?,
            version: version?,
            log_messages: log_messages?,
            accounts: accounts?,
            instructions: instructions?,
        })
    }

    fn signatures(&mut self, value: &RawValue) -> Option<Vec<String>> {
        let signatures = self.array(value, Self::id)?;
        if signatures.is_empty() {
            self.issue(IssueKind::Empty);
            return None;
        }
        Some(signatures)
    }

    fn version(&mut self, value: &RawValue) -> Option<TransactionVersion> {
        match value {
            RawValue::String(s) if s == "legacy" => Some(TransactionVersion::Legacy),
            RawValue::Number(n) if n.as_u64() == Some(0) => Some(TransactionVersion::V0),
            _ => {
                self.issue(IssueKind::InvalidLiteral {
                    expected: "\"legacy\" | 0",
                });
                None
            }
        }
    }

    fn accounts(&mut self, value: &RawValue) -> Option<Vec<Account>> {
        let accounts = self.array(value, Self::account)?;
        let mut unique = true;
        {
            let mut seen: HashMap<&str, usize> = HashMap::with_capacity(accounts.len());
            for (index, account) in accounts.iter().enumerate() {
                match seen.get(account.pubkey.as_str()) {
                    Some(&first_index) => {
                        unique = false;
                        self.at_index(index, |v| {
                            v.at_key("pubkey", |v| v.issue(IssueKind::DuplicateKey { first_index }))
                        });
                    }
                    None => {
                        seen.insert(&account.pubkey, index);
                    }
                }
            }
        }
        unique.then_some(accounts)
    }

    fn account(&mut self, value: &RawValue) -> Option<Account> {
        let obj = self.object(value, ACCOUNT_KEYS)?;

        let pubkey = self.required(obj, "pubkey", Self::id);
        let is_signer = self.required(obj, "isSigner", Self::boolean);
        let is_writeable = self.required(obj, "isWriteable", Self::boolean);
        let pre_balance = self.required(obj, "preBalance", Self::big);
        let post_balance = self.required(obj, "postBalance", Self::big);
        let pre_token_balance = self.optional(obj, "preTokenBalance", Self::token_balance);
        let post_token_balance = self.optional(obj, "postTokenBalance", Self::token_balance);

        Some(Account {
            pubkey: pubkey?,
            is_signer: is_signer?,
            is_writeable: is_writeable?,
            pre_balance: pre_balance?,
            post_balance: post_balance?,
            pre_token_balance: pre_token_balance?,
            post_token_balance: post_token_balance?,
        })
    }

    fn token_balance(&mut self, value: &RawValue) -> Option<TokenBalance> {
        let obj = self.object(value, TOKEN_BALANCE_KEYS)?;

        let mint = self.required(obj, "mint", Self::id);
        let owner = self.required(obj, "owner", Self::id);
        let amount = self.required(obj, "amount", Self::big);
        let decimals = self.required(obj, "decimals", |v, x| v.integer::<u8>(x, "u8"));

        Some(TokenBalance {
            mint: mint?,
            owner: owner?,
            amount: amount?,
            decimals: decimals?,
        })
    }

    fn instruction(&mut self, value: &RawValue) -> Option<Instruction> {
        let obj = self.object(value, INSTRUCTION_KEYS)?;

        let stack_height = self.required(obj, "stackHeight", Self::stack_height);
        let program_id_index =
            self.required(obj, "programIdIndex", |v, x| v.integer::<u8>(x, "u8"));
        let data = self.required(obj, "data", Self::base58);
        let accounts = self.required(obj, "accounts", |v, x| {
            v.array(x, |v, x| v.integer::<u8>(x, "u8"))
        });

        Some(Instruction {
            stack_height: stack_height?,
            program_id_index: program_id_index?,
            data: data?,
            accounts: accounts?,
        })
    }

    /// `null` when the ledger did not report a depth
    fn stack_height(&mut self, value: &RawValue) -> Option<Option<u32>> {
        if matches!(value, RawValue::Null) {
            return Some(None);
        }
        let height = self.integer::<u32>(value, "u32")?;
        if height == 0 {
            self.issue(IssueKind::OutOfRange {
                expected: "integer >= 1",
            });
            return None;
        }
        Some(Some(height))
    }

    fn transaction_error(&mut self, value: &RawValue) -> Option<TransactionError> {
        let obj = self.object(value, ERROR_KEYS)?;
        let variants = ERROR_KEYS.iter().filter(|key| obj.contains_key(**key)).count();
        if variants != 1 {
            self.issue(IssueKind::VariantCount { received: variants });
            return None;
        }
        if obj.contains_key("InstructionError") {
            self.required(obj, "InstructionError", Self::instruction_error)
        } else {
            self.required(obj, "InsufficientFundsForRent", Self::rent_error)
        }
    }

    /// `[index, "Named"]` or `[index, {"Custom": code}]`
    fn instruction_error(&mut self, value: &RawValue) -> Option<TransactionError> {
        let RawValue::Array(items) = value else {
            self.type_issue("array", value);
            return None;
        };
        let [index, cause] = items.as_slice() else {
            self.issue(IssueKind::InvalidLength {
                expected: 2,
                received: items.len(),
            });
            return None;
        };
        let index = self.at_index(0, |v| v.integer::<u8>(index, "u8"));
        let cause = self.at_index(1, |v| v.instruction_error_cause(cause));
        Some(TransactionError::InstructionError {
            index: index?,
            cause: cause?,
        })
    }

    fn instruction_error_cause(&mut self, value: &RawValue) -> Option<InstructionErrorCause> {
        match value {
            RawValue::String(name) => Some(InstructionErrorCause::Named(name.clone())),
            RawValue::Object(_) => {
                let obj = self.object(value, &["Custom"])?;
                let code = self.required(obj, "Custom", |v, x| v.integer::<u32>(x, "u32"))?;
                Some(InstructionErrorCause::Custom(code))
            }
            other => {
                self.type_issue("string or {Custom}", other);
                None
            }
        }
    }

    fn rent_error(&mut self, value: &RawValue) -> Option<TransactionError> {
        let obj = self.object(value, &["account_index"])?;
        let account_index = self.required(obj, "account_index", |v, x| v.integer::<u8>(x, "u8"))?;
        Some(TransactionError::InsufficientFundsForRent { account_index })
    }
}
