pub mod chat;
pub mod diary;
pub mod domain;
pub mod identifier;
pub mod ports;
pub mod report;

pub use diary::DiaryIndex;
pub use domain::{Chat, ChatSummary, Message, MessageWithSender, Profile};
pub use identifier::{parse_identifier, Identifier, IdentifierError};
pub use ports::{
    BackendService, ChangeEvent, ChangeFilter, ChangeKind, ChangeStream, PortError, PortResult,
    Table,
};
pub use report::{normalize_report, normalize_reports, DailyReport, ReportRecord};
