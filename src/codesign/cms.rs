//! Certificate summaries from the CMS signature blob.

use std::fmt;

use chrono::NaiveDate;
use cryptographic_message_syntax::SignedData;
use tracing::debug;
use x509_certificate::CapturedX509Certificate;

use crate::error::{Error, Result};

/// Summary of one certificate embedded in a CMS SignedData envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertificateSummary {
    /// Issuer organization, falling back to the organizational unit
    pub issuer_org: String,
    /// Subject common name
    pub subject_cn: String,
    /// Start of the validity window
    pub not_before: NaiveDate,
    /// End of the validity window
    pub not_after: NaiveDate,
}

impl CertificateSummary {
    fn from_certificate(cert: &CapturedX509Certificate) -> Self {
        let issuer = cert.issuer_name();
        let issuer_org = issuer
            .iter_organization()
            .next()
            .or_else(|| issuer.iter_organizational_unit().next())
            .and_then(|attr| attr.to_string().ok())
            .unwrap_or_default();

        Self {
            issuer_org,
            subject_cn: cert.subject_common_name().unwrap_or_default(),
            not_before: cert.validity_not_before().date_naive(),
            not_after: cert.validity_not_after().date_naive(),
        }
    }
}

impl fmt::Display for CertificateSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "OU: {} CN: {} ({} thru {})",
            self.issuer_org, self.subject_cn, self.not_before, self.not_after
        )
    }
}

/// Extracts certificate summaries from a DER/BER CMS SignedData blob.
///
/// `offset` is the file offset of `cms`, reported on failure.
pub fn parse_certificates(cms: &[u8], offset: u64) -> Result<Vec<CertificateSummary>> {
    let signed_data = SignedData::parse_ber(cms)
        .map_err(|e| Error::malformed_signature(offset, format!("invalid CMS envelope: {e}")))?;

    let certificates: Vec<_> = signed_data
        .certificates()
        .map(CertificateSummary::from_certificate)
        .collect();
    debug!(count = certificates.len(), "extracted CMS certificates");
    Ok(certificates)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{
        apple_root_cms, certificate, cms_with_certificates, APPLE_ROOT_NAME, OID_COMMON_NAME,
        OID_COUNTRY, OID_ORGANIZATIONAL_UNIT,
    };

    #[test]
    fn test_apple_root_certificate() {
        let certs = parse_certificates(&apple_root_cms(), 0).unwrap();
        assert_eq!(certs.len(), 1);

        let cert = &certs[0];
        assert_eq!(cert.issuer_org, "Apple Inc.");
        assert_eq!(cert.subject_cn, "Apple Root CA");
        assert_eq!(cert.not_before, NaiveDate::from_ymd_opt(2006, 4, 25).unwrap());
        assert_eq!(cert.not_after, NaiveDate::from_ymd_opt(2035, 2, 9).unwrap());
        assert_eq!(
            cert.to_string(),
            "OU: Apple Inc. CN: Apple Root CA (2006-04-25 thru 2035-02-09)"
        );
    }

    #[test]
    fn test_issuer_falls_back_to_organizational_unit() {
        let issuer = [
            (OID_COUNTRY, "US"),
            (OID_ORGANIZATIONAL_UNIT, "Apple Worldwide Developer Relations"),
            (OID_COMMON_NAME, "Apple WWDR CA"),
        ];
        let leaf = certificate(
            0x02,
            &issuer,
            &[(OID_COMMON_NAME, "Software Signing")],
            "130207215648Z",
            "230207215648Z",
        );
        let certs = parse_certificates(&cms_with_certificates(&[leaf]), 0).unwrap();

        assert_eq!(certs.len(), 1);
        assert_eq!(certs[0].issuer_org, "Apple Worldwide Developer Relations");
        assert_eq!(certs[0].subject_cn, "Software Signing");
        assert_eq!(certs[0].not_before, NaiveDate::from_ymd_opt(2013, 2, 7).unwrap());
        assert_eq!(certs[0].not_after, NaiveDate::from_ymd_opt(2023, 2, 7).unwrap());
    }

    #[test]
    fn test_chain_keeps_stored_order() {
        let intermediate_name = [
            (OID_ORGANIZATIONAL_UNIT, "Apple Certification Authority"),
            (OID_COMMON_NAME, "Apple Code Signing Certification Authority"),
        ];
        let leaf = certificate(
            0x03,
            &intermediate_name,
            &[(OID_COMMON_NAME, "Software Signing")],
            "131024175342Z",
            "211024175342Z",
        );
        let intermediate = certificate(
            0x04,
            APPLE_ROOT_NAME,
            &intermediate_name,
            "111024173941Z",
            "261024173941Z",
        );
        let certs =
            parse_certificates(&cms_with_certificates(&[leaf, intermediate]), 0).unwrap();

        let names: Vec<_> = certs.iter().map(|c| c.subject_cn.as_str()).collect();
        assert_eq!(
            names,
            vec!["Software Signing", "Apple Code Signing Certification Authority"]
        );
        assert_eq!(certs[0].issuer_org, "Apple Certification Authority");
        assert_eq!(certs[1].issuer_org, "Apple Inc.");
        assert_eq!(certs[1].not_after, NaiveDate::from_ymd_opt(2026, 10, 24).unwrap());
    }

    #[test]
    fn test_garbage_envelope() {
        assert!(matches!(
            parse_certificates(&[0x30, 0x03, 0x02, 0x01], 0x40),
            Err(Error::MalformedSignature { offset: 0x40, .. })
        ));
    }
}
