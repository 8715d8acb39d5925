//! Map parsed label/value pairs onto a structured referral.

use std::sync::LazyLock;

use chrono::NaiveDate;
use regex::Regex;
use serde::{Deserialize, Serialize};

use super::types::ParsedDocument;
use crate::ers::Ubrn;

/// Leading decimal number, units ignored ("92.4 kg" → 92.4).
static LEADING_NUMBER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*(\d+(?:\.\d+)?)").unwrap());

const NHS_NUMBER_LABELS: &[&str] = &["nhs number", "nhs no", "nhs no.", "nhs"];
const GIVEN_NAME_LABELS: &[&str] = &["given name", "given names", "forename", "forenames", "first name"];
const FAMILY_NAME_LABELS: &[&str] = &["family name", "surname", "last name"];
const FULL_NAME_LABELS: &[&str] = &["name", "patient name", "full name"];
const DATE_OF_BIRTH_LABELS: &[&str] = &["date of birth", "dob", "d.o.b", "d.o.b."];
const SEX_LABELS: &[&str] = &["sex", "gender"];
const ADDRESS_LABELS: &[&str] = &["address", "home address", "address line 1"];
const ADDRESS2_LABELS: &[&str] = &["address line 2"];
const ADDRESS3_LABELS: &[&str] = &["address line 3", "town", "city"];
const POSTCODE_LABELS: &[&str] = &["postcode", "post code"];
const TELEPHONE_LABELS: &[&str] = &["telephone", "telephone number", "tel", "home telephone", "phone"];
const MOBILE_LABELS: &[&str] = &["mobile", "mobile number", "mobile telephone"];
const EMAIL_LABELS: &[&str] = &["email", "email address", "e-mail"];
const ETHNICITY_LABELS: &[&str] = &["ethnicity", "ethnic origin", "ethnic group"];
const HEIGHT_LABELS: &[&str] = &["height", "height (cm)", "height cm"];
const WEIGHT_LABELS: &[&str] = &["weight", "weight (kg)", "weight kg"];
const BMI_LABELS: &[&str] = &["bmi", "body mass index", "calculated bmi"];
const BMI_DATE_LABELS: &[&str] = &["date of bmi", "bmi date", "date bmi recorded"];
const DIABETES_TYPE1_LABELS: &[&str] = &["diabetes type 1", "type 1 diabetes"];
const DIABETES_TYPE2_LABELS: &[&str] = &["diabetes type 2", "type 2 diabetes"];
const HYPERTENSION_LABELS: &[&str] = &["hypertension", "has hypertension"];
const GP_PRACTICE_LABELS: &[&str] = &["gp practice code", "practice code", "gp practice ods code", "ods code"];

const DATE_FORMATS: &[&str] = &["%d/%m/%Y", "%d-%m-%Y", "%Y-%m-%d", "%d.%m.%Y", "%d %b %Y", "%d %B %Y"];

/// Referral fields read from an attachment.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReferralFields {
    pub nhs_number: Option<String>,
    pub given_name: Option<String>,
    pub family_name: Option<String>,
    pub date_of_birth: Option<NaiveDate>,
    pub sex: Option<String>,
    pub address1: Option<String>,
    pub address2: Option<String>,
    pub address3: Option<String>,
    pub postcode: Option<String>,
    pub telephone: Option<String>,
    pub mobile: Option<String>,
    pub email: Option<String>,
    pub ethnicity: Option<String>,
    pub height_cm: Option<f64>,
    pub weight_kg: Option<f64>,
    pub calculated_bmi: Option<f64>,
    pub date_of_bmi: Option<NaiveDate>,
    pub has_diabetes_type1: Option<bool>,
    pub has_diabetes_type2: Option<bool>,
    pub has_hypertension: Option<bool>,
    pub gp_practice_code: Option<String>,
    /// Values present in the document that could not be used.
    #[serde(skip)]
    pub warnings: Vec<String>,
}

/// Body of a create/update call to the local referral API.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReferralRequest {
    pub ubrn: Ubrn,
    pub service_id: Option<String>,
    pub referral_attachment_id: Option<String>,
    /// Registry version of the referral the document came from.
    pub registry_version: Option<String>,
    #[serde(flatten)]
    pub fields: ReferralFields,
}

impl ReferralRequest {
    /// Combine document fields with registry metadata. The registry NHS
    /// number fills in when the document has none.
    pub fn new(
        ubrn: Ubrn,
        mut fields: ReferralFields,
        registry_nhs_number: Option<&str>,
        service_id: Option<String>,
        attachment_id: Option<String>,
        registry_version: Option<String>,
    ) -> Self {
        if fields.nhs_number.is_none() {
            fields.nhs_number = registry_nhs_number.map(normalize_nhs_number);
        }
        Self {
            ubrn,
            service_id,
            referral_attachment_id: attachment_id,
            registry_version,
            fields,
        }
    }
}

/// Populate referral fields from a parsed document.
pub fn map_referral(doc: &ParsedDocument) -> ReferralFields {
    let mut fields = ReferralFields::default();

    if let Some(raw) = lookup(doc, NHS_NUMBER_LABELS) {
        let normalized = normalize_nhs_number(raw);
        if validate_nhs_number(&normalized) {
            fields.nhs_number = Some(normalized);
        } else {
            fields
                .warnings
                .push(format!("NHS number '{raw}' failed check digit validation"));
        }
    }

    fields.given_name = lookup(doc, GIVEN_NAME_LABELS).map(str::to_string);
    fields.family_name = lookup(doc, FAMILY_NAME_LABELS).map(str::to_string);
    if fields.given_name.is_none() && fields.family_name.is_none() {
        if let Some(full) = lookup(doc, FULL_NAME_LABELS) {
            let (given, family) = split_full_name(full);
            fields.given_name = given;
            fields.family_name = family;
        }
    }

    fields.date_of_birth = date_field(doc, DATE_OF_BIRTH_LABELS, "date of birth", &mut fields.warnings);
    fields.sex = lookup(doc, SEX_LABELS).map(str::to_string);
    fields.address1 = lookup(doc, ADDRESS_LABELS).map(str::to_string);
    fields.address2 = lookup(doc, ADDRESS2_LABELS).map(str::to_string);
    fields.address3 = lookup(doc, ADDRESS3_LABELS).map(str::to_string);
    fields.postcode = lookup(doc, POSTCODE_LABELS).map(|p| p.to_uppercase());
    fields.telephone = lookup(doc, TELEPHONE_LABELS).map(str::to_string);
    fields.mobile = lookup(doc, MOBILE_LABELS).map(str::to_string);
    fields.email = lookup(doc, EMAIL_LABELS).map(str::to_string);
    fields.ethnicity = lookup(doc, ETHNICITY_LABELS).map(str::to_string);
    fields.height_cm = lookup(doc, HEIGHT_LABELS).and_then(parse_leading_number);
    fields.weight_kg = lookup(doc, WEIGHT_LABELS).and_then(parse_leading_number);
    fields.calculated_bmi = lookup(doc, BMI_LABELS).and_then(parse_leading_number);
    fields.date_of_bmi = date_field(doc, BMI_DATE_LABELS, "BMI date", &mut fields.warnings);
    fields.has_diabetes_type1 = lookup(doc, DIABETES_TYPE1_LABELS).and_then(parse_yes_no);
    fields.has_diabetes_type2 = lookup(doc, DIABETES_TYPE2_LABELS).and_then(parse_yes_no);
    fields.has_hypertension = lookup(doc, HYPERTENSION_LABELS).and_then(parse_yes_no);
    fields.gp_practice_code = lookup(doc, GP_PRACTICE_LABELS).map(|c| c.to_uppercase());

    fields
}

/// First non-empty value under any of `aliases`.
fn lookup<'a>(doc: &'a ParsedDocument, aliases: &[&str]) -> Option<&'a str> {
    aliases
        .iter()
        .filter_map(|alias| doc.get(alias))
        .find(|value| !value.trim().is_empty())
        .map(str::trim)
}

fn date_field(
    doc: &ParsedDocument,
    aliases: &[&str],
    name: &str,
    warnings: &mut Vec<String>,
) -> Option<NaiveDate> {
    let raw = lookup(doc, aliases)?;
    let parsed = parse_date(raw);
    if parsed.is_none() {
        warnings.push(format!("Unrecognised {name} '{raw}'"));
    }
    parsed
}

/// "Jane Smith" → ("Jane", "Smith"); "SMITH, Jane" → ("Jane", "SMITH").
fn split_full_name(full: &str) -> (Option<String>, Option<String>) {
    if let Some((family, given)) = full.split_once(',') {
        let given = given.trim();
        let family = family.trim();
        return (
            (!given.is_empty()).then(|| given.to_string()),
            (!family.is_empty()).then(|| family.to_string()),
        );
    }
    let mut words: Vec<&str> = full.split_whitespace().collect();
    match words.len() {
        0 => (None, None),
        1 => (None, Some(words[0].to_string())),
        _ => {
            let family = words.pop().map(str::to_string);
            (Some(words.join(" ")), family)
        }
    }
}

/// Strip spaces, dashes and other separators.
pub fn normalize_nhs_number(raw: &str) -> String {
    raw.chars().filter(|c| c.is_ascii_alphanumeric()).collect()
}

/// Modulus-11 check on a 10-digit NHS number. Separators are ignored.
pub fn validate_nhs_number(raw: &str) -> bool {
    let normalized = normalize_nhs_number(raw);
    if normalized.len() != 10 {
        return false;
    }
    let digits: Vec<u32> = match normalized.chars().map(|c| c.to_digit(10)).collect() {
        Some(d) => d,
        None => return false,
    };

    let sum: u32 = digits[..9]
        .iter()
        .enumerate()
        .map(|(i, d)| d * (10 - i as u32))
        .sum();
    let check = match 11 - (sum % 11) {
        11 => 0,
        10 => return false,
        c => c,
    };
    check == digits[9]
}

/// Parse a date in any of the accepted formats. Trailing text after the
/// date ("01/02/1980 (44 yrs)") is ignored.
pub fn parse_date(raw: &str) -> Option<NaiveDate> {
    let words: Vec<&str> = raw.split_whitespace().collect();
    let candidates = [
        words.join(" "),
        words.iter().take(3).copied().collect::<Vec<_>>().join(" "),
        words.first().copied().unwrap_or_default().to_string(),
    ];
    candidates.iter().find_map(|candidate| {
        DATE_FORMATS
            .iter()
            .find_map(|fmt| NaiveDate::parse_from_str(candidate, fmt).ok())
    })
}

/// yes/y/true and no/n/false, case-insensitive. Anything else is unknown.
pub fn parse_yes_no(raw: &str) -> Option<bool> {
    let word = raw
        .split(|c: char| c.is_whitespace() || c == ',' || c == '.')
        .find(|w| !w.is_empty())?
        .to_lowercase();
    match word.as_str() {
        "yes" | "y" | "true" => Some(true),
        "no" | "n" | "false" => Some(false),
        _ => None,
    }
}

pub fn parse_leading_number(raw: &str) -> Option<f64> {
    LEADING_NUMBER
        .captures(raw)
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse().ok())
}
