/// The stored record of an installed next objective.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct NextGroupRecord {
    /// The ID of the next objective which this record belongs to.
    #[prost(uint32, required, tag = "1")]
    pub next_id: u32,
    /// The group key chains of the objective, one per bucket, outermost key first.
    #[prost(message, repeated, tag = "2")]
    pub chains: ::prost::alloc::vec::Vec<KeyChain>,
}
/// An ordered chain of group keys.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct KeyChain {
    /// The raw group keys of this chain.
    #[prost(bytes = "vec", repeated, tag = "1")]
    pub keys: ::prost::alloc::vec::Vec<::prost::alloc::vec::Vec<u8>>,
}
