//! Bridged token contract ABI definition
//!
//! Uses alloy's sol! macro to generate type-safe bindings for the token contract.

use alloy::sol;

sol! {
    /// Wrapped source-chain token, mintable and burnable by the bridge operator
    #[sol(rpc)]
    contract BridgedToken {
        /// Mint tokens for a confirmed source-chain deposit
        ///
        /// # Arguments
        /// * `recipient` - Settlement-chain owner of the deposit address
        /// * `amount` - Amount in source-chain base units (8 decimals)
        /// * `depositId` - keccak256("txid:address"); reverts when already processed
        function mint(address recipient, uint256 amount, bytes32 depositId) external;

        /// Burn tokens from a holder (operator only)
        function burn(address holder, uint256 amount) external;

        /// Whether a deposit id has already been minted
        function processedDeposits(bytes32 depositId) external view returns (bool);

        /// Mark an on-chain withdrawal request as paid out on the source chain
        function confirmWithdrawal(uint256 requestId, bytes32 sourceTxid) external;

        event Mint(address indexed recipient, uint256 amount, bytes32 indexed depositId);

        event Burn(address indexed holder, uint256 amount);

        /// Emitted when a holder burns tokens to withdraw to a source-chain address
        event WithdrawalRequested(
            uint256 indexed requestId,
            address indexed requester,
            uint256 amount,
            string destination
        );
    }
}
