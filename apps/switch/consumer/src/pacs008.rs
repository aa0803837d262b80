//! pacs.008.001.08 FI-to-FI customer credit transfers (ISO 20022 XML).
//!
//! ```xml
//! <Document xmlns="urn:iso:std:iso:20022:tech:xsd:pacs.008.001.08">
//!   <FIToFICstmrCdtTrf>
//!     <GrpHdr>
//!       <MsgId>...</MsgId><NbOfTxs>1</NbOfTxs>
//!       <SttlmInf><SttlmMtd>CLRG</SttlmMtd></SttlmInf>
//!     </GrpHdr>
//!     <CdtTrfTxInf>
//!       <PmtId><InstrId>...</InstrId></PmtId>
//!       <IntrBkSttlmAmt Ccy="MYR">1500.00</IntrBkSttlmAmt>
//!       <IntrBkSttlmDt>2026-01-15</IntrBkSttlmDt>
//!       <ChrgBr>SHAR</ChrgBr>
//!       <DbtrAgt><FinInstnId><BICFI>ALPHMYKLXXX</BICFI></FinInstnId></DbtrAgt>
//!       <CdtrAgt><FinInstnId><BICFI>BETASGSG</BICFI></FinInstnId></CdtrAgt>
//!     </CdtTrfTxInf>
//!   </FIToFICstmrCdtTrf>
//! </Document>
//! ```
//!
//! Missing elements deserialize as empty so that the rules, not the parser,
//! report them. Elements the rules never read (accounts, clearing system,
//! instructing agents) are skipped.

use crate::directory::BankDirectory;
use chrono::{DateTime, Utc};
use relay_worker::{
    Inspection, ProcessingResult, TransferRequest, Validation, Validator, WorkItem,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use thiserror::Error;

pub const SETTLEMENT_METHODS: [&str; 4] = ["CLRG", "INDA", "INGA", "COVE"];
pub const CHARGE_BEARERS: [&str; 4] = ["DEBT", "CRED", "SHAR", "SLEV"];

pub const CODE_XML_PARSE_ERROR: &str = "XML_PARSE_ERROR";
pub const CODE_LIQUIDITY_CHECK_ERROR: &str = "LIQUIDITY_CHECK_ERROR";

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("payload is not UTF-8: {0}")]
    Encoding(#[from] std::str::Utf8Error),

    #[error(transparent)]
    Xml(#[from] quick_xml::DeError),
}

/// Root `Document` element; its name and namespace attributes are not checked.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct Document {
    #[serde(rename = "FIToFICstmrCdtTrf")]
    pub credit_transfer: CreditTransfer,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct CreditTransfer {
    #[serde(rename = "GrpHdr")]
    pub group_header: GroupHeader,
    #[serde(rename = "CdtTrfTxInf")]
    pub transactions: Vec<Transaction>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct GroupHeader {
    #[serde(rename = "MsgId")]
    pub msg_id: String,
    #[serde(rename = "CreDtTm")]
    pub created_at: String,
    #[serde(rename = "NbOfTxs")]
    pub tx_count: String,
    #[serde(rename = "SttlmInf")]
    pub settlement: SettlementInfo,
}

impl GroupHeader {
    /// Declared transaction count; anything non-numeric counts as 0.
    pub fn tx_count(&self) -> i64 {
        self.tx_count.trim().parse().unwrap_or(0)
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct SettlementInfo {
    #[serde(rename = "SttlmMtd")]
    pub method: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct Transaction {
    #[serde(rename = "PmtId")]
    pub payment_id: PaymentId,
    #[serde(rename = "IntrBkSttlmAmt")]
    pub amount: Amount,
    #[serde(rename = "IntrBkSttlmDt")]
    pub settlement_date: String,
    #[serde(rename = "ChrgBr")]
    pub charge_bearer: String,
    #[serde(rename = "Dbtr")]
    pub debtor: Party,
    #[serde(rename = "DbtrAgt")]
    pub debtor_agent: Agent,
    #[serde(rename = "Cdtr")]
    pub creditor: Party,
    #[serde(rename = "CdtrAgt")]
    pub creditor_agent: Agent,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct PaymentId {
    #[serde(rename = "InstrId")]
    pub instruction_id: String,
    #[serde(rename = "EndToEndId")]
    pub end_to_end_id: String,
    #[serde(rename = "UETR")]
    pub uetr: String,
}

/// `<IntrBkSttlmAmt Ccy="MYR">1500.00</IntrBkSttlmAmt>`
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct Amount {
    #[serde(rename = "@Ccy")]
    pub currency: String,
    #[serde(rename = "$text")]
    pub value: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct Party {
    #[serde(rename = "Nm")]
    pub name: String,
    #[serde(rename = "PstlAdr")]
    pub address: PostalAddress,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct PostalAddress {
    #[serde(rename = "Ctry")]
    pub country: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct Agent {
    #[serde(rename = "FinInstnId")]
    pub institution: Institution,
}

impl Agent {
    pub fn bic(&self) -> &str {
        &self.institution.bic
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct Institution {
    #[serde(rename = "BICFI")]
    pub bic: String,
}

impl Document {
    pub fn parse(raw: &[u8]) -> Result<Self, ParseError> {
        let xml = std::str::from_utf8(raw)?;
        Ok(quick_xml::de::from_str(xml)?)
    }

    pub fn first_transaction(&self) -> Option<&Transaction> {
        self.credit_transfer.transactions.first()
    }
}

/// ISO 3166 country from BIC positions 5-6, or `XX`.
pub fn country_from_bic(bic: &str) -> String {
    bic.get(4..6).unwrap_or("XX").to_string()
}

fn bic_length_ok(bic: &str) -> bool {
    (8..=11).contains(&bic.len())
}

/// Run every rule against `doc`. The last failing rule decides the code.
pub fn validate_document(doc: &Document) -> Validation {
    let header = &doc.credit_transfer.group_header;
    let transactions = &doc.credit_transfer.transactions;
    let mut validation = Validation::valid("Transaction valid");

    if header.msg_id.is_empty() {
        validation.fail("MISSING_MSG_ID", "Message ID is required");
    } else {
        validation.reference = Some(header.msg_id.clone());
    }

    if header.tx_count() <= 0 {
        validation.fail("INVALID_TX_COUNT", "Transaction count must be greater than 0");
    }

    if !SETTLEMENT_METHODS.contains(&header.settlement.method.as_str()) {
        validation.fail(
            "INVALID_STTLM_MTD",
            "Settlement Method must be one of: CLRG, INDA, INGA, COVE",
        );
    }

    if transactions.is_empty() {
        validation.fail("NO_TRANSACTIONS", "At least one transaction is required");
    }

    if let Some(first) = transactions.first() {
        if !bic_length_ok(first.debtor_agent.bic()) {
            validation.fail("INVALID_DBTR_BIC", "Debtor BIC must be 8 or 11 characters");
        }
        if !bic_length_ok(first.creditor_agent.bic()) {
            validation.fail("INVALID_CDTR_BIC", "Creditor BIC must be 8 or 11 characters");
        }
    }

    for (i, tx) in transactions.iter().enumerate() {
        if tx.payment_id.instruction_id.is_empty() {
            validation.fail(
                format!("MISSING_PMT_ID_TX{i}"),
                format!("Payment ID (InstrId) is required for transaction {i}"),
            );
        }
        if tx.amount.currency.is_empty() {
            validation.fail(
                format!("MISSING_CURRENCY_TX{i}"),
                format!("Currency is required for transaction {i}"),
            );
        }
        if tx.amount.value.is_empty() {
            validation.fail(
                format!("MISSING_AMOUNT_TX{i}"),
                format!("Amount is required for transaction {i}"),
            );
        }
        if tx.settlement_date.is_empty() {
            validation.fail(
                format!("MISSING_STTLM_DT_TX{i}"),
                format!("Interbank Settlement Date is required for transaction {i}"),
            );
        }
        if !CHARGE_BEARERS.contains(&tx.charge_bearer.as_str()) {
            validation.fail(
                format!("INVALID_CHRG_BR_TX{i}"),
                format!("Charge Bearer must be one of: DEBT, CRED, SHAR, SLEV for transaction {i}"),
            );
        }
    }

    validation
}

/// What subscribers see for one processed credit transfer.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionSummary {
    pub id: String,
    pub msg_id: String,
    pub source: String,
    pub source_country: String,
    pub destination: String,
    pub dest_country: String,
    pub amount: f64,
    pub currency: String,
    pub status: &'static str,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub error_code: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub error_msg: String,
    pub timestamp: DateTime<Utc>,
    /// The document as received
    pub xml: String,
    /// Milliseconds
    pub latency: u64,
}

/// pacs.008 rules plus the liquidity mapping through the bank directory.
pub struct Pacs008Rules {
    directory: Arc<BankDirectory>,
}

impl Pacs008Rules {
    pub fn new(directory: Arc<BankDirectory>) -> Self {
        Self { directory }
    }
}

impl Validator for Pacs008Rules {
    fn inspect(&self, item: &WorkItem) -> Box<dyn Inspection> {
        Box::new(Pacs008Inspection {
            item_id: item.id.clone(),
            xml: String::from_utf8_lossy(&item.payload).into_owned(),
            document: Document::parse(&item.payload),
            directory: Arc::clone(&self.directory),
        })
    }
}

/// One credit transfer, parsed once.
pub struct Pacs008Inspection {
    item_id: String,
    xml: String,
    document: Result<Document, ParseError>,
    directory: Arc<BankDirectory>,
}

impl Pacs008Inspection {
    fn party_name(&self, party: &Party, agent: &Agent) -> String {
        if !party.name.is_empty() {
            return party.name.clone();
        }
        let id = self.directory.bank_id(agent.bic());
        self.directory
            .bank(id)
            .map(|bank| bank.name.clone())
            .unwrap_or_else(|| agent.bic().to_string())
    }

    fn country(party: &Party, agent: &Agent) -> String {
        if party.address.country.is_empty() {
            country_from_bic(agent.bic())
        } else {
            party.address.country.clone()
        }
    }
}

impl Inspection for Pacs008Inspection {
    fn transfer(&self) -> Result<Option<TransferRequest>, Validation> {
        // Unparsable documents are reported by `validate`
        let Ok(doc) = &self.document else {
            return Ok(None);
        };
        let Some(tx) = doc.first_transaction() else {
            return Ok(None);
        };

        let amount: f64 = tx.amount.value.trim().parse().map_err(|_| {
            Validation::invalid(CODE_LIQUIDITY_CHECK_ERROR, "Failed to parse amount")
        })?;

        let creditor = match tx.creditor_agent.bic() {
            "" => None,
            bic => Some(self.directory.bank_id(bic).to_string()),
        };

        Ok(Some(TransferRequest {
            debtor: self.directory.bank_id(tx.debtor_agent.bic()).to_string(),
            creditor,
            amount,
            currency: tx.amount.currency.clone(),
        }))
    }

    fn validate(&self) -> Validation {
        match &self.document {
            Ok(doc) => validate_document(doc),
            Err(e) => {
                Validation::invalid(CODE_XML_PARSE_ERROR, format!("Failed to parse XML: {e}"))
            }
        }
    }

    fn summarize(&self, result: &ProcessingResult) -> Option<Value> {
        let doc = self.document.as_ref().ok()?;
        let tx = doc.first_transaction()?;

        let summary = TransactionSummary {
            id: format!("tx-{}", self.item_id),
            msg_id: doc.credit_transfer.group_header.msg_id.clone(),
            source: self.party_name(&tx.debtor, &tx.debtor_agent),
            source_country: Self::country(&tx.debtor, &tx.debtor_agent),
            destination: self.party_name(&tx.creditor, &tx.creditor_agent),
            dest_country: Self::country(&tx.creditor, &tx.creditor_agent),
            amount: tx.amount.value.trim().parse().unwrap_or(0.0),
            currency: tx.amount.currency.clone(),
            status: if result.accepted { "approved" } else { "rejected" },
            error_code: result.code.clone(),
            error_msg: if result.accepted {
                String::new()
            } else {
                result.message.clone()
            },
            timestamp: result.timestamp,
            xml: self.xml.clone(),
            latency: result.latency_ms(),
        };
        serde_json::to_value(summary).ok()
    }
}
