// @generated
// This file is @generated by prost-build.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct LiquidityCheckRequest {
    #[prost(string, tag = "1")]
    pub bank_id: ::prost::alloc::string::String,
    #[prost(double, tag = "2")]
    pub transaction_amount: f64,
    #[prost(string, tag = "3")]
    pub currency: ::prost::alloc::string::String,
}
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct LiquidityCheckResponse {
    #[prost(bool, tag = "1")]
    pub approved: bool,
    #[prost(double, tag = "2")]
    pub available_balance: f64,
    #[prost(string, tag = "3")]
    pub error_code: ::prost::alloc::string::String,
    #[prost(string, tag = "4")]
    pub error_message: ::prost::alloc::string::String,
}
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct CreditBankRequest {
    #[prost(string, tag = "1")]
    pub bank_id: ::prost::alloc::string::String,
    #[prost(double, tag = "2")]
    pub amount: f64,
    #[prost(string, tag = "3")]
    pub currency: ::prost::alloc::string::String,
}
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct CreditBankResponse {
    #[prost(bool, tag = "1")]
    pub success: bool,
    #[prost(double, tag = "2")]
    pub new_balance: f64,
    #[prost(string, tag = "3")]
    pub status_code: ::prost::alloc::string::String,
    #[prost(string, tag = "4")]
    pub message: ::prost::alloc::string::String,
}
#[derive(Clone, Copy, PartialEq, Eq, Hash, ::prost::Message)]
pub struct GetBalancesRequest {}
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct BankBalance {
    #[prost(string, tag = "1")]
    pub bank_id: ::prost::alloc::string::String,
    #[prost(double, tag = "2")]
    pub balance: f64,
    #[prost(string, tag = "3")]
    pub currency: ::prost::alloc::string::String,
}
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct GetBalancesResponse {
    #[prost(message, repeated, tag = "1")]
    pub balances: ::prost::alloc::vec::Vec<BankBalance>,
}
// @@protoc_insertion_point(module)
