// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Request messages and the SOAP envelope around them.
//!
//! Every operation is a `<root>` message with an access block, a request
//! block (`tipo` and `procesoid`) and a `<documento>` of fields. The message
//! is embedded unescaped inside `AtenderMensajeRNDC/Request`.
//!
//! | Operation | tipo | procesoid |
//! |-----------|------|-----------|
//! | Query manifests | 9 | 4 |
//! | Arrival/departure report | 1 | 60 |
//! | Annul report | 1 | 68 |
//! | Exception report | 1 | 46 |

use std::fmt::Write as _;

use super::datetime::RegulatorClock;
use super::payload::{AnnulSubmission, ExceptionSubmission, QueryMode, ReportSubmission};
use crate::session::Credentials;
use geocontrol_core::Departure;

/// `SOAPAction` header value.
pub const SOAP_ACTION: &str = "urn:BPMServicesIntf-IBPMServices#AtenderMensajeRNDC";

/// `Content-Type` header value.
pub const CONTENT_TYPE: &str = "text/xml; charset=utf-8";

const QUERY: (u8, u16) = (9, 4);
const REPORT: (u8, u16) = (1, 60);
const ANNUL: (u8, u16) = (1, 68);
const EXCEPTION: (u8, u16) = (1, 46);

/// Escape text for an XML element body.
pub fn escape(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            _ => out.push(c),
        }
    }
    out
}

/// Wrap a `<root>` message in the SOAP envelope.
pub fn soap_envelope(message: &str) -> String {
    format!(
        concat!(
            r#"<soapenv:Envelope xmlns:soapenv="http://schemas.xmlsoap.org/soap/envelope/" "#,
            r#"xmlns:urn="urn:BPMServicesIntf-IBPMServices">"#,
            "<soapenv:Header/><soapenv:Body><urn:AtenderMensajeRNDC><urn:Request>",
            "{}",
            "</urn:Request></urn:AtenderMensajeRNDC></soapenv:Body></soapenv:Envelope>"
        ),
        message
    )
}

/// Builds request messages for one account.
#[derive(Debug, Clone)]
pub struct MessageBuilder {
    credentials: Credentials,
    gps_id: String,
    clock: RegulatorClock,
}

impl MessageBuilder {
    /// Builder for `credentials` and the provider's GPS id.
    pub fn new(credentials: Credentials, gps_id: impl Into<String>, clock: RegulatorClock) -> Self {
        Self {
            credentials,
            gps_id: gps_id.into(),
            clock,
        }
    }

    /// Bulk manifest query.
    pub fn query_manifests(&self, mode: QueryMode) -> String {
        self.message(
            QUERY,
            &[("numidgps", self.gps_id.clone()), ("manifiestos", mode.as_str().to_string())],
        )
    }

    /// Single manifest query.
    pub fn query_manifest(&self, external_id: &str) -> String {
        self.message(
            QUERY,
            &[
                ("numidgps", self.gps_id.clone()),
                ("ingresoidmanifiesto", external_id.to_string()),
            ],
        )
    }

    /// Arrival/departure report.
    pub fn report(&self, submission: &ReportSubmission) -> String {
        let location = submission.reported_location();
        let mut fields = vec![
            ("numidgps", self.gps_id.clone()),
            ("ingresoidmanifiesto", submission.manifest_external_id.clone()),
            ("numplaca", submission.plate.clone()),
            ("codpuntocontrol", submission.point_code.to_string()),
            ("latitud", location.latitude.to_string()),
            ("longitud", location.longitude.to_string()),
            ("fechallegada", self.clock.date(submission.arrival.at)),
            ("horallegada", self.clock.time(submission.arrival.at)),
        ];
        match submission.departure {
            Departure::Observed(fix) | Departure::Estimated(fix) => {
                fields.push(("fechasalida", self.clock.date(fix.at)));
                fields.push(("horasalida", self.clock.time(fix.at)));
            }
            Departure::NotObserved => fields.push(("sinsalida", "S".to_string())),
        }
        self.message(REPORT, &fields)
    }

    /// Annulment of an accepted report.
    pub fn annul(&self, submission: &AnnulSubmission) -> String {
        self.message(
            ANNUL,
            &[
                ("numidgps", self.gps_id.clone()),
                ("ingresoidrmm", submission.confirmation_id.clone()),
                ("ingresoidmanifiesto", submission.manifest_external_id.clone()),
                ("numplaca", submission.plate.clone()),
                ("codpuntocontrol", submission.point_code.to_string()),
                ("observaciones", submission.observations.clone()),
            ],
        )
    }

    /// Exception report.
    pub fn exception(&self, submission: &ExceptionSubmission) -> String {
        self.message(
            EXCEPTION,
            &[
                ("numidgps", self.gps_id.clone()),
                ("ingresoidmanifiesto", submission.manifest_external_id.clone()),
                ("numplaca", submission.plate.clone()),
                ("codpuntocontrol", submission.point_code.to_string()),
                ("codnovedad", submission.code.code().to_string()),
            ],
        )
    }

    fn message(&self, (kind, process): (u8, u16), fields: &[(&str, String)]) -> String {
        let mut xml = String::from("<root><acceso>");
        let _ = write!(
            xml,
            "<username>{}</username><password>{}</password>",
            escape(&self.credentials.username),
            escape(&self.credentials.password)
        );
        let _ = write!(
            xml,
            "</acceso><solicitud><tipo>{kind}</tipo><procesoid>{process}</procesoid></solicitud>"
        );
        xml.push_str("<documento>");
        for (name, value) in fields {
            let _ = write!(xml, "<{name}>{}</{name}>", escape(value));
        }
        xml.push_str("</documento></root>");
        xml
    }
}
