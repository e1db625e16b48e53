use std::process::Command;

use chrono::Utc;
use phonenumber::country;
use uuid::Uuid;

pub fn uuid() -> String {
    Uuid::new_v4().to_string()
}

pub fn unix_millis() -> i64 {
    Utc::now().timestamp_millis()
}

/// Conference ids are derived from the creation time and the lead they were
/// created for, so two qualifications of the same lead never collide.
pub fn conference_id(lead_id: &str) -> String {
    let lead: String = lead_id
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '-' || *c == '_')
        .collect();
    format!("conf_{}_{}", unix_millis(), lead)
}

/// Normalize a dialable number to E.164. Numbers without a leading `+` are
/// read as North American numbers.
pub fn normalize_phone(input: &str) -> Option<String> {
    let trimmed: String = input
        .chars()
        .filter(|c| c.is_ascii_digit() || *c == '+')
        .collect();
    if trimmed.is_empty() {
        return None;
    }
    let number = phonenumber::parse(Some(country::US), &trimmed).ok()?;
    Some(number.format().mode(phonenumber::Mode::E164).to_string())
}

pub fn get_hostname() -> Option<String> {
    let output = match Command::new("hostname").output() {
        Ok(ok) => ok,
        Err(_) => {
            return None;
        }
    };

    let stdout = match String::from_utf8(output.stdout) {
        Ok(ok) => ok,
        Err(_) => {
            return None;
        }
    };

    Some(stdout.trim().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_national_and_e164() {
        assert_eq!(normalize_phone("+15551234567").as_deref(), Some("+15551234567"));
        assert_eq!(
            normalize_phone("(555) 123-4567").as_deref(),
            Some("+15551234567")
        );
        assert_eq!(normalize_phone("   ").as_deref(), None);
    }

    #[test]
    fn conference_id_keeps_lead() {
        let id = conference_id("lead 42/x");
        assert!(id.starts_with("conf_"));
        assert!(id.ends_with("_lead42x"));
    }
}
